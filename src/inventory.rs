//! The testbed's node inventory.
//!
//! When the reporter sits in front of a whole testbed rather than a single
//! board, it knows up front which nodes exist and where they are. That list
//! lives in a RON file:
//!
//! ```text
//! [
//!     (id: "m3-10", x: 20.33, y: 26.4, z: 9.2),
//!     (id: "m3-11", x: 20.93, y: 26.4, z: 9.2, label: Some("sink")),
//! ]
//! ```
//!
//! and is sent to the anchor as a `nodesInfo` record every time the link
//! comes up.

use crate::wire::NodeInfo;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::{borrow::Cow, fmt, fs, io, path::Path};

/// Things that go wrong while loading an inventory.
#[derive(Debug)]
pub enum InventoryError {
    /// The file could not be read
    IoError(io::Error),

    /// The file is not a valid inventory
    RonSpannedError(ron::error::SpannedError),
}

impl fmt::Display for InventoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InventoryError as IE;
        let msg = match self {
            IE::IoError(error) => Cow::from(format!("io error: {}", error)),
            IE::RonSpannedError(error) => Cow::from(format!("ron error: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for InventoryError {}

impl From<io::Error> for InventoryError {
    fn from(value: io::Error) -> Self {
        Self::IoError(value)
    }
}

impl From<ron::error::SpannedError> for InventoryError {
    fn from(value: ron::error::SpannedError) -> Self {
        Self::RonSpannedError(value)
    }
}

#[derive(Debug, Deserialize)]
struct Entry {
    id: String,
    #[serde(default)]
    label: Option<String>,
    x: f64,
    y: f64,
    #[serde(default)]
    z: f64,
}

/// A random offset of up to a third of a unit either way, so that nodes
/// mounted on the same spot do not hide each other.
fn jitter(rng: &mut impl Rng) -> f64 {
    let magnitude = rng.gen::<f64>() / 3.0;
    if rng.gen_bool(0.5) {
        magnitude
    } else {
        -magnitude
    }
}

fn describe(entry: Entry, rng: &mut impl Rng) -> NodeInfo {
    let mut extra = Map::new();
    extra.insert(
        "label".to_owned(),
        Value::from(entry.label.unwrap_or_else(|| entry.id.clone())),
    );
    extra.insert("size".to_owned(), json!(1));
    extra.insert("default_size".to_owned(), json!(1));
    extra.insert("animate_size".to_owned(), json!(1.5));
    extra.insert("x".to_owned(), json!(entry.x + jitter(rng)));
    extra.insert("y".to_owned(), json!(entry.y + jitter(rng)));
    extra.insert("z".to_owned(), json!(entry.z + jitter(rng)));

    NodeInfo {
        id: entry.id,
        extra,
    }
}

/// Parses an inventory, jittering positions with `rng`.
pub fn parse_inventory(text: &str, rng: &mut impl Rng) -> Result<Vec<NodeInfo>, InventoryError> {
    let entries: Vec<Entry> = ron::from_str(text)?;
    Ok(entries.into_iter().map(|e| describe(e, rng)).collect())
}

/// Reads and parses an inventory file.
pub fn load_inventory(path: impl AsRef<Path>) -> Result<Vec<NodeInfo>, InventoryError> {
    let text = fs::read_to_string(path)?;
    parse_inventory(&text, &mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::io::Write;

    const INVENTORY: &str = r#"[
        (id: "m3-10", x: 20.0, y: 26.0, z: 9.0),
        (id: "m3-11", x: 21.0, y: 26.0, label: Some("sink")),
    ]"#;

    #[test]
    fn parses_and_fills_defaults() {
        let mut rng = StdRng::seed_from_u64(7);
        let nodes = parse_inventory(INVENTORY, &mut rng).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "m3-10");
        assert_eq!(nodes[0].extra["label"], "m3-10");
        assert_eq!(nodes[1].extra["label"], "sink");
        assert_eq!(nodes[1].extra["size"], 1);
    }

    #[test]
    fn positions_stay_within_a_third() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let nodes = parse_inventory(INVENTORY, &mut rng).unwrap();
            let x = nodes[0].extra["x"].as_f64().unwrap();
            let z = nodes[1].extra["z"].as_f64().unwrap();
            assert!((x - 20.0).abs() <= 1.0 / 3.0);
            assert!(z.abs() <= 1.0 / 3.0);
        }
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(INVENTORY.as_bytes()).unwrap();
        let nodes = load_inventory(file.path()).unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn reports_bad_files() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            parse_inventory("[(x: 1.0)]", &mut rng),
            Err(InventoryError::RonSpannedError(_))
        ));
        assert!(matches!(
            load_inventory("/nonexistent/riot-tv/inventory.ron"),
            Err(InventoryError::IoError(_))
        ));
    }
}
