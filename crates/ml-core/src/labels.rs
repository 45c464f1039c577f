use std::{collections::BTreeMap, fs, path::Path};

use thiserror::Error;

/// Class names of the 21-class PASCAL VOC MobileNet-SSD model.
pub const VOC_CLASSES: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("failed to read label table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("label table is not a JSON object of id -> name: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("label table key {0:?} is not an integer class id")]
    InvalidId(String),
}

/// Mapping from detector class id to display name.
///
/// A missing id is not an error: callers treat it as "no label" and skip the
/// detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassLabelTable {
    names: BTreeMap<i64, String>,
}

impl ClassLabelTable {
    pub fn voc() -> Self {
        VOC_CLASSES
            .iter()
            .enumerate()
            .map(|(id, name)| (id as i64, (*name).to_string()))
            .collect()
    }

    /// Parse `{"7": "car", "15": "person"}`.
    pub fn from_json_str(json: &str) -> Result<Self, LabelError> {
        let raw: BTreeMap<String, String> = serde_json::from_str(json)?;
        raw.into_iter()
            .map(|(key, name)| {
                key.trim()
                    .parse::<i64>()
                    .map(|id| (id, name))
                    .map_err(|_| LabelError::InvalidId(key))
            })
            .collect()
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LabelError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| LabelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn get(&self, class_id: i64) -> Option<&str> {
        self.names.get(&class_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FromIterator<(i64, String)> for ClassLabelTable {
    fn from_iter<I: IntoIterator<Item = (i64, String)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}
