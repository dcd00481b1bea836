/// 1-based line/column position, resolved from a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Maps byte offsets to line/column positions within source text.
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        SourceMap { line_starts }
    }

    pub fn position(&self, offset: usize) -> Position {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        Position {
            line: line + 1,
            column: offset.saturating_sub(self.line_starts[line]) + 1,
        }
    }
}

/// One-shot lookup for error construction, where building a map per error
/// would be wasteful only in the aggregate; errors are rare.
pub fn position_of(source: &str, offset: usize) -> Position {
    SourceMap::new(source).position(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_byte_is_one_one() {
        let sm = SourceMap::new("let x = 1;");
        assert_eq!(sm.position(0), Position { line: 1, column: 1 });
    }

    #[test]
    fn offsets_across_lines() {
        let sm = SourceMap::new("ab\ncd\nef");
        assert_eq!(sm.position(2), Position { line: 1, column: 3 }); // the '\n'
        assert_eq!(sm.position(3), Position { line: 2, column: 1 });
        assert_eq!(sm.position(6), Position { line: 3, column: 1 });
    }

    #[test]
    fn empty_source() {
        let sm = SourceMap::new("");
        assert_eq!(sm.position(0), Position { line: 1, column: 1 });
    }

    #[test]
    fn display_format() {
        assert_eq!(Position { line: 3, column: 7 }.to_string(), "3:7");
    }
}
