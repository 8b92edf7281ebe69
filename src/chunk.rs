//! Chunking strategies.
//!
//! A chunking strategy is a pure function from a byte sequence to a finite,
//! ordered sequence of half-open `[start, end)` ranges that tile the input.
//! Strategies are parameterized, side-effect free, and deterministic:
//! identical inputs always yield identical ranges.
//!
//! | Strategy | Parameters | Advance |
//! |----------|------------|---------|
//! | fixed | `chunk_size > 0`, `overlap ∈ [0, chunk_size)` | `chunk_size − overlap` bytes |
//! | lines | `line_count > 0`, `overlap ∈ [0, line_count)` | `line_count − overlap` lines |
//! | delimiter | non-empty regex | next delimiter occurrence |
//!
//! The delimiter strategy assigns the range containing each delimiter to the
//! following chunk. All strategies honor an optional `max_chunks` cap by
//! truncation.

use regex::Regex;

use crate::errors::{EngineError, Result};
use crate::models::ChunkStrategy;

/// A validated, ready-to-run chunker built from a [`ChunkStrategy`] record.
#[derive(Debug)]
pub enum Chunker {
    Fixed {
        chunk_size: usize,
        overlap: usize,
        max_chunks: Option<usize>,
    },
    Lines {
        line_count: usize,
        overlap: usize,
        max_chunks: Option<usize>,
    },
    Delimiter {
        pattern: Regex,
        max_chunks: Option<usize>,
    },
}

impl Chunker {
    /// Validate a strategy record and build the chunker.
    ///
    /// Rejects invalid parameters with a descriptive [`EngineError::InvalidArgument`]
    /// naming the offending field.
    pub fn from_strategy(strategy: &ChunkStrategy) -> Result<Self> {
        match strategy {
            ChunkStrategy::Fixed {
                chunk_size,
                overlap,
                max_chunks,
            } => {
                if *chunk_size == 0 {
                    return Err(EngineError::invalid("chunk_size", "must be greater than 0"));
                }
                if *overlap >= *chunk_size {
                    return Err(EngineError::invalid(
                        "overlap",
                        format!("must be smaller than chunk_size ({chunk_size})"),
                    ));
                }
                Ok(Chunker::Fixed {
                    chunk_size: *chunk_size,
                    overlap: *overlap,
                    max_chunks: *max_chunks,
                })
            }
            ChunkStrategy::Lines {
                line_count,
                overlap,
                max_chunks,
            } => {
                if *line_count == 0 {
                    return Err(EngineError::invalid("line_count", "must be greater than 0"));
                }
                if *overlap >= *line_count {
                    return Err(EngineError::invalid(
                        "overlap",
                        format!("must be smaller than line_count ({line_count})"),
                    ));
                }
                Ok(Chunker::Lines {
                    line_count: *line_count,
                    overlap: *overlap,
                    max_chunks: *max_chunks,
                })
            }
            ChunkStrategy::Delimiter {
                delimiter,
                max_chunks,
            } => {
                if delimiter.is_empty() {
                    return Err(EngineError::invalid("delimiter", "must not be empty"));
                }
                let pattern = Regex::new(delimiter).map_err(|e| {
                    EngineError::invalid("delimiter", format!("invalid pattern: {e}"))
                })?;
                Ok(Chunker::Delimiter {
                    pattern,
                    max_chunks: *max_chunks,
                })
            }
            ChunkStrategy::Manual => Err(EngineError::invalid(
                "strategy",
                "manual spans are not produced by chunking",
            )),
        }
    }

    /// Emit the `[start, end)` byte ranges for `content`.
    pub fn chunk(&self, content: &str) -> Vec<(usize, usize)> {
        let ranges = match self {
            Chunker::Fixed {
                chunk_size,
                overlap,
                ..
            } => chunk_fixed(content.len(), *chunk_size, *overlap),
            Chunker::Lines {
                line_count,
                overlap,
                ..
            } => chunk_lines(content, *line_count, *overlap),
            Chunker::Delimiter { pattern, .. } => chunk_delimiter(content, pattern),
        };

        match self.max_chunks() {
            Some(cap) => ranges.into_iter().take(cap).collect(),
            None => ranges,
        }
    }

    fn max_chunks(&self) -> Option<usize> {
        match self {
            Chunker::Fixed { max_chunks, .. }
            | Chunker::Lines { max_chunks, .. }
            | Chunker::Delimiter { max_chunks, .. } => *max_chunks,
        }
    }
}

fn chunk_fixed(len: usize, chunk_size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < len {
        let end = (start + chunk_size).min(len);
        ranges.push((start, end));
        if end >= len {
            break;
        }
        start += chunk_size - overlap;
    }
    ranges
}

fn chunk_lines(content: &str, line_count: usize, overlap: usize) -> Vec<(usize, usize)> {
    if content.is_empty() {
        return Vec::new();
    }

    // Byte offset of each line start, plus the end of the content.
    let mut line_offsets = vec![0usize];
    for (i, b) in content.bytes().enumerate() {
        if b == b'\n' && i + 1 < content.len() {
            line_offsets.push(i + 1);
        }
    }
    let total_lines = line_offsets.len();
    line_offsets.push(content.len());

    let mut ranges = Vec::new();
    let mut i = 0;
    while i < total_lines {
        let end_line = (i + line_count).min(total_lines);
        ranges.push((line_offsets[i], line_offsets[end_line]));
        if end_line >= total_lines {
            break;
        }
        i += line_count - overlap;
    }
    ranges
}

fn chunk_delimiter(content: &str, pattern: &Regex) -> Vec<(usize, usize)> {
    if content.is_empty() {
        return Vec::new();
    }

    let matches: Vec<(usize, usize)> = pattern
        .find_iter(content)
        .map(|m| (m.start(), m.end()))
        .collect();

    if matches.is_empty() {
        return vec![(0, content.len())];
    }

    let mut ranges = Vec::new();
    if matches[0].0 > 0 {
        ranges.push((0, matches[0].0));
    }
    for (i, (start, _)) in matches.iter().enumerate() {
        let end = match matches.get(i + 1) {
            Some((next_start, _)) => *next_start,
            None => content.len(),
        };
        if end > *start {
            ranges.push((*start, end));
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(strategy: ChunkStrategy) -> Chunker {
        Chunker::from_strategy(&strategy).unwrap()
    }

    fn fixed(chunk_size: usize, overlap: usize) -> ChunkStrategy {
        ChunkStrategy::Fixed {
            chunk_size,
            overlap,
            max_chunks: None,
        }
    }

    #[test]
    fn test_fixed_tiles_exactly() {
        let ranges = chunker(fixed(4, 0)).chunk("0123456789");
        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn test_fixed_with_overlap() {
        let ranges = chunker(fixed(4, 1)).chunk("0123456789");
        // Advance by chunk_size - overlap = 3.
        assert_eq!(ranges, vec![(0, 4), (3, 7), (6, 10)]);
    }

    #[test]
    fn test_fixed_short_input_single_chunk() {
        let ranges = chunker(fixed(100, 10)).chunk("tiny");
        assert_eq!(ranges, vec![(0, 4)]);
    }

    #[test]
    fn test_fixed_empty_input() {
        let ranges = chunker(fixed(10, 0)).chunk("");
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_fixed_rejects_zero_size() {
        assert!(Chunker::from_strategy(&fixed(0, 0)).is_err());
    }

    #[test]
    fn test_fixed_rejects_overlap_ge_size() {
        let err = Chunker::from_strategy(&fixed(10, 10)).unwrap_err();
        assert!(err.to_string().contains("overlap"));
        assert!(Chunker::from_strategy(&fixed(10, 11)).is_err());
    }

    #[test]
    fn test_lines_windows() {
        let content = "a\nb\nc\nd\ne\n";
        let ranges = chunker(ChunkStrategy::Lines {
            line_count: 2,
            overlap: 0,
            max_chunks: None,
        })
        .chunk(content);
        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(&content[0..4], "a\nb\n");
        assert_eq!(&content[8..10], "e\n");
    }

    #[test]
    fn test_lines_with_overlap() {
        let content = "a\nb\nc\nd\n";
        let ranges = chunker(ChunkStrategy::Lines {
            line_count: 2,
            overlap: 1,
            max_chunks: None,
        })
        .chunk(content);
        assert_eq!(ranges, vec![(0, 4), (2, 6), (4, 8)]);
    }

    #[test]
    fn test_lines_no_trailing_newline() {
        let content = "one\ntwo\nthree";
        let ranges = chunker(ChunkStrategy::Lines {
            line_count: 2,
            overlap: 0,
            max_chunks: None,
        })
        .chunk(content);
        assert_eq!(ranges, vec![(0, 8), (8, 13)]);
        assert_eq!(&content[8..13], "three");
    }

    #[test]
    fn test_delimiter_assigns_to_following_chunk() {
        let content = "intro## a## b";
        let ranges = chunker(ChunkStrategy::Delimiter {
            delimiter: "##".to_string(),
            max_chunks: None,
        })
        .chunk(content);
        assert_eq!(ranges, vec![(0, 5), (5, 9), (9, 13)]);
        assert_eq!(&content[5..9], "## a");
        assert_eq!(&content[9..13], "## b");
    }

    #[test]
    fn test_delimiter_no_match_whole_input() {
        let ranges = chunker(ChunkStrategy::Delimiter {
            delimiter: "ZZZ".to_string(),
            max_chunks: None,
        })
        .chunk("no delimiters here");
        assert_eq!(ranges, vec![(0, 18)]);
    }

    #[test]
    fn test_delimiter_at_start() {
        let content = "## first## second";
        let ranges = chunker(ChunkStrategy::Delimiter {
            delimiter: "##".to_string(),
            max_chunks: None,
        })
        .chunk(content);
        assert_eq!(ranges, vec![(0, 8), (8, 17)]);
        assert_eq!(&content[0..8], "## first");
    }

    #[test]
    fn test_delimiter_rejects_bad_regex() {
        let err = Chunker::from_strategy(&ChunkStrategy::Delimiter {
            delimiter: "([".to_string(),
            max_chunks: None,
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }

    #[test]
    fn test_max_chunks_truncates() {
        let ranges = chunker(ChunkStrategy::Fixed {
            chunk_size: 2,
            overlap: 0,
            max_chunks: Some(3),
        })
        .chunk("0123456789");
        assert_eq!(ranges, vec![(0, 2), (2, 4), (4, 6)]);
    }

    #[test]
    fn test_ranges_within_bounds_and_ordered() {
        let inputs = ["", "x", "hello world", "a\nb\nc", &"long ".repeat(100)];
        let strategies = [
            fixed(7, 2),
            ChunkStrategy::Lines {
                line_count: 1,
                overlap: 0,
                max_chunks: None,
            },
            ChunkStrategy::Delimiter {
                delimiter: " ".to_string(),
                max_chunks: None,
            },
        ];
        for input in inputs {
            for strategy in &strategies {
                let ranges = Chunker::from_strategy(strategy).unwrap().chunk(input);
                let mut prev_start = 0;
                for (start, end) in ranges {
                    assert!(start < end, "empty range for {strategy:?}");
                    assert!(end <= input.len());
                    assert!(start >= prev_start, "starts must be non-decreasing");
                    prev_start = start;
                }
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let content = "alpha\nbeta\ngamma\ndelta";
        let a = chunker(fixed(5, 2)).chunk(content);
        let b = chunker(fixed(5, 2)).chunk(content);
        assert_eq!(a, b);
    }
}
