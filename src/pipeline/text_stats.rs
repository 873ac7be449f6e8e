//! Structural statistics of an extracted Markdown artifact.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

struct Patterns {
    header: Regex,
    section: Regex,
    checked: Regex,
    unchecked: Regex,
    radio_selected: Regex,
    table_line: Regex,
}

impl Patterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            header: Regex::new(r"(?m)^#\s+\S")?,
            section: Regex::new(r"(?m)^#{2,}\s+\S")?,
            checked: Regex::new(r"\[[xX]\]")?,
            unchecked: Regex::new(r"\[ \]")?,
            radio_selected: Regex::new(r"\(•\)")?,
            table_line: Regex::new(r"(?m)^\s*\|.*\|\s*$")?,
        })
    }
}

static PATTERNS: LazyLock<Option<Patterns>> = LazyLock::new(|| Patterns::new().ok());

/// Counts of the structures the extraction instructions ask the model to emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TextStats {
    pub chars: usize,
    pub lines: usize,
    pub headers: usize,
    pub sections: usize,
    pub checked_boxes: usize,
    pub unchecked_boxes: usize,
    pub radio_selections: usize,
    pub table_lines: usize,
}

impl TextStats {
    pub fn from_markdown(text: &str) -> Self {
        let mut stats = Self {
            chars: text.chars().count(),
            lines: text.lines().count(),
            ..Default::default()
        };
        if let Some(p) = PATTERNS.as_ref() {
            stats.headers = p.header.find_iter(text).count();
            stats.sections = p.section.find_iter(text).count();
            stats.checked_boxes = p.checked.find_iter(text).count();
            stats.unchecked_boxes = p.unchecked.find_iter(text).count();
            stats.radio_selections = p.radio_selected.find_iter(text).count();
            stats.table_lines = p.table_line.find_iter(text).count();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_markdown_structures() {
        let text = "\
# Site Information

## Page 1

- [x] Cooling water available
- [ ] Foundation ready
- [X] Power supply

Mounting: (•) Horizontal ( ) Vertical

| Item | Qty |
|------|-----|
| Gearbox | 1 |

---
";
        let stats = TextStats::from_markdown(text);
        assert_eq!(stats.headers, 1);
        assert_eq!(stats.sections, 1);
        assert_eq!(stats.checked_boxes, 2);
        assert_eq!(stats.unchecked_boxes, 1);
        assert_eq!(stats.radio_selections, 1);
        assert_eq!(stats.table_lines, 3);
    }

    #[test]
    fn empty_text_is_all_zero() {
        assert_eq!(TextStats::from_markdown(""), TextStats::default());
    }
}
