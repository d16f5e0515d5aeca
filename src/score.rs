/// Score extraction
///
/// Reduces a classifier's per-class confidences to the single relevance score
/// the state machine consumes, and maps category keywords to class indices.

use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ClassMapError {
    #[error("Failed to read class map {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed class map line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Dense class-index -> confidence mapping for one window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassScores {
    scores: Vec<f32>,
}

impl ClassScores {
    pub fn new(scores: Vec<f32>) -> Self {
        Self { scores }
    }

    /// Collapse per-frame rows into one row by averaging each class
    ///
    /// Models like YAMNet emit several overlapping frames per window; ragged
    /// rows average over the frames that contain the class.
    pub fn mean_of_frames(frames: &[Vec<f32>]) -> Self {
        let classes = frames.iter().map(Vec::len).max().unwrap_or(0);
        let mut sums = vec![0.0f64; classes];
        let mut counts = vec![0u32; classes];

        for row in frames {
            for (class, &score) in row.iter().enumerate() {
                sums[class] += score as f64;
                counts[class] += 1;
            }
        }

        let scores = sums
            .iter()
            .zip(&counts)
            .map(|(&sum, &count)| if count == 0 { 0.0 } else { (sum / count as f64) as f32 })
            .collect();

        Self { scores }
    }

    pub fn get(&self, class: usize) -> Option<f32> {
        self.scores.get(class).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.scores
    }
}

impl From<Vec<f32>> for ClassScores {
    fn from(scores: Vec<f32>) -> Self {
        Self::new(scores)
    }
}

/// Maximum score among `target_indices`
///
/// A single strongly firing class is enough, so this takes the max rather
/// than the mean. Missing or empty targets score 0.0.
pub fn extract(class_scores: &ClassScores, target_indices: &[usize]) -> f32 {
    target_indices
        .iter()
        .filter_map(|&class| class_scores.get(class))
        .fold(0.0f32, f32::max)
}

/// Indices of every class whose name contains one of `categories`
///
/// Matching is a case-insensitive substring test.
pub fn resolve_target_indices<S: AsRef<str>>(class_names: &[String], categories: &[S]) -> Vec<usize> {
    let keywords: Vec<String> = categories
        .iter()
        .map(|c| c.as_ref().trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect();

    let indices: BTreeSet<usize> = class_names
        .iter()
        .enumerate()
        .filter(|(_, name)| {
            let name = name.to_lowercase();
            keywords.iter().any(|k| name.contains(k.as_str()))
        })
        .map(|(i, _)| i)
        .collect();

    indices.into_iter().collect()
}

/// Class display names loaded from a model's `class_map.csv`
#[derive(Debug, Clone, Default)]
pub struct ClassMap {
    names: Vec<String>,
}

impl ClassMap {
    pub fn from_names(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Parse `index,mid,display_name` rows
    ///
    /// A header row is skipped. Display names may be double-quoted and
    /// contain commas.
    pub fn parse(csv: &str) -> Result<Self, ClassMapError> {
        let mut names = Vec::new();

        for (line_no, line) in csv.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let fields = split_csv_line(line);
            if fields.len() < 3 {
                return Err(ClassMapError::Malformed {
                    line: line_no + 1,
                    reason: format!("expected 3 fields, found {}", fields.len()),
                });
            }

            let index = match fields[0].trim().parse::<usize>() {
                Ok(index) => index,
                Err(_) if names.is_empty() && line_no == 0 => continue, // header
                Err(_) => {
                    return Err(ClassMapError::Malformed {
                        line: line_no + 1,
                        reason: format!("bad class index '{}'", fields[0]),
                    })
                }
            };

            if index != names.len() {
                return Err(ClassMapError::Malformed {
                    line: line_no + 1,
                    reason: format!("expected index {}, found {}", names.len(), index),
                });
            }

            names.push(fields[2].trim().to_string());
        }

        debug!("Parsed class map with {} classes", names.len());
        Ok(Self { names })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClassMapError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ClassMapError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Class indices matching any of `categories`
    pub fn resolve<S: AsRef<str>>(&self, categories: &[S]) -> Vec<usize> {
        resolve_target_indices(&self.names, categories)
    }
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);

    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const CLASS_MAP: &str = "index,mid,display_name\n\
        0,/m/09x0r,Speech\n\
        1,/m/05r5c,\"Piano\"\n\
        2,/m/01s0ps,Electric piano\n\
        3,/m/0l14md,\"Keyboard (musical)\"\n\
        4,/m/0ytgt,\"Child speech, kid speaking\"\n";

    #[test]
    fn test_extract_takes_max() {
        let scores = ClassScores::new(vec![0.9, 0.1, 0.4, 0.3]);
        assert_relative_eq!(extract(&scores, &[1, 2, 3]), 0.4);
        assert_relative_eq!(extract(&scores, &[0, 1]), 0.9);
    }

    #[test]
    fn test_extract_empty_targets() {
        let scores = ClassScores::new(vec![0.9, 0.8]);
        assert_eq!(extract(&scores, &[]), 0.0);
    }

    #[test]
    fn test_extract_ignores_missing_indices() {
        let scores = ClassScores::new(vec![0.2, 0.7]);
        assert_relative_eq!(extract(&scores, &[1, 99]), 0.7);
        assert_eq!(extract(&scores, &[42]), 0.0);
    }

    #[test]
    fn test_mean_of_frames() {
        let frames = vec![vec![0.2, 0.8], vec![0.4, 0.0]];
        let scores = ClassScores::mean_of_frames(&frames);

        assert_eq!(scores.len(), 2);
        assert_relative_eq!(scores.get(0).unwrap(), 0.3, epsilon = 1e-6);
        assert_relative_eq!(scores.get(1).unwrap(), 0.4, epsilon = 1e-6);
    }

    #[test]
    fn test_mean_of_no_frames() {
        assert!(ClassScores::mean_of_frames(&[]).is_empty());
    }

    #[test]
    fn test_parse_class_map() {
        let map = ClassMap::parse(CLASS_MAP).unwrap();

        assert_eq!(map.len(), 5);
        assert_eq!(map.name(1), Some("Piano"));
        assert_eq!(map.name(4), Some("Child speech, kid speaking"));
    }

    #[test]
    fn test_parse_rejects_out_of_order_index() {
        let result = ClassMap::parse("0,/m/a,First\n2,/m/b,Third\n");
        assert!(matches!(result, Err(ClassMapError::Malformed { line: 2, .. })));
    }

    #[test]
    fn test_resolve_keywords() {
        let map = ClassMap::parse(CLASS_MAP).unwrap();

        assert_eq!(map.resolve(&["piano"]), vec![1, 2]);
        assert_eq!(map.resolve(&["PIANO", "keyboard"]), vec![1, 2, 3]);
        assert!(map.resolve(&["violin"]).is_empty());
        assert!(map.resolve::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_blank_keyword_matches_nothing() {
        let map = ClassMap::parse(CLASS_MAP).unwrap();
        assert!(map.resolve(&["  "]).is_empty());
    }
}
