//! Line-oriented scanner that tracks whether the tail of a text buffer
//! is inside an unclosed list, table, or fenced code block.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    List,
    Table,
    Fence,
}

#[derive(Debug, Default)]
pub struct BlockScanner {
    in_fence: bool,
    in_list: bool,
    in_table: bool,
}

impl BlockScanner {
    pub fn in_block(&self) -> bool {
        self.in_fence || self.in_list || self.in_table
    }

    pub fn current(&self) -> Option<BlockKind> {
        if self.in_fence {
            Some(BlockKind::Fence)
        } else if self.in_list {
            Some(BlockKind::List)
        } else if self.in_table {
            Some(BlockKind::Table)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.in_fence = false;
        self.in_list = false;
        self.in_table = false;
    }

    /// Re-derive block state from scratch over `text`'s complete lines
    /// (everything up to and including the last `\n`; a trailing partial
    /// line is not yet judged). Returns whether a block that was open
    /// before this call just closed.
    pub fn rescan(&mut self, text: &str) -> bool {
        let was_in_block = self.in_block();
        let complete = match text.rfind('\n') {
            Some(i) => &text[..=i],
            None => "",
        };

        let mut in_fence = false;
        let mut in_list = false;
        let mut in_table = false;

        for line in complete.split_terminator('\n') {
            if in_fence {
                if is_fence_delim(line) {
                    in_fence = false;
                }
                continue;
            }
            if is_fence_delim(line) {
                in_fence = true;
                continue;
            }
            if in_list {
                if line.trim().is_empty() {
                    in_list = false;
                }
                continue;
            }
            if in_table {
                if line.trim().is_empty() {
                    in_table = false;
                }
                continue;
            }
            if is_list_item(line) {
                in_list = true;
            } else if is_table_row(line) {
                in_table = true;
            }
        }

        self.in_fence = in_fence;
        self.in_list = in_list;
        self.in_table = in_table;

        was_in_block && !self.in_block()
    }
}

fn is_fence_delim(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn is_list_item(line: &str) -> bool {
    let t = line.trim_start();
    if t.starts_with("- ") || t.starts_with("* ") || t.starts_with("+ ") {
        return true;
    }
    match t.find(". ") {
        Some(pos) if pos > 0 => t.as_bytes()[..pos].iter().all(u8::is_ascii_digit),
        _ => false,
    }
}

fn is_table_row(line: &str) -> bool {
    line.trim().starts_with('|') || (line.contains('|') && line.trim().len() > 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_never_enters_a_block() {
        let mut s = BlockScanner::default();
        s.rescan("just a line\nanother line\n");
        assert!(!s.in_block());
    }

    #[test]
    fn list_stays_open_across_items_and_closes_on_blank_line() {
        let mut s = BlockScanner::default();
        s.rescan("- a\n- b\n");
        assert_eq!(s.current(), Some(BlockKind::List));
        let closed = s.rescan("- a\n- b\n\n");
        assert!(closed);
        assert!(!s.in_block());
    }

    #[test]
    fn fence_stays_open_until_matching_closing_fence() {
        let mut s = BlockScanner::default();
        s.rescan("```rust\nfn x() {}\n");
        assert_eq!(s.current(), Some(BlockKind::Fence));
        let closed = s.rescan("```rust\nfn x() {}\n```\n");
        assert!(closed);
    }

    #[test]
    fn trailing_partial_line_is_not_judged_yet() {
        let mut s = BlockScanner::default();
        s.rescan("- a\nno newline at end");
        assert_eq!(s.current(), Some(BlockKind::List));
    }
}
