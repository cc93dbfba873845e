//! Hand-written reader for the `watcher { ... }` configuration grammar.
//!
//! This is a conventional recursive-descent parser over a small hand-rolled
//! tokenizer, not a parser-combinator or grammar-generator dependency — the
//! grammar is small enough that pulling one in would cost more than it
//! saves. Every diagnostic is collected with its line number rather than
//! aborting at the first one, so a single run reports every mistake.

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    String(String),
    Number(i64),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Equals,
}

struct Located<T> {
    token: T,
    line: u32,
}

fn tokenize(source: &str) -> Result<Vec<Located<Token>>, ConfigError> {
    let mut tokens = Vec::new();
    let mut line: u32 = 1;
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '{' => {
                chars.next();
                tokens.push(Located { token: Token::LBrace, line });
            }
            '}' => {
                chars.next();
                tokens.push(Located { token: Token::RBrace, line });
            }
            '(' => {
                chars.next();
                tokens.push(Located { token: Token::LParen, line });
            }
            ')' => {
                chars.next();
                tokens.push(Located { token: Token::RParen, line });
            }
            ',' => {
                chars.next();
                tokens.push(Located { token: Token::Comma, line });
            }
            ';' => {
                chars.next();
                tokens.push(Located { token: Token::Semicolon, line });
            }
            '=' => {
                chars.next();
                tokens.push(Located { token: Token::Equals, line });
            }
            '"' => {
                let start_line = line;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        Some('\n') => {
                            return Err(ConfigError::new(
                                "<config>",
                                start_line,
                                "unterminated string literal",
                            ))
                        }
                        Some(c) => value.push(c),
                        None => {
                            return Err(ConfigError::new(
                                "<config>",
                                start_line,
                                "unterminated string literal",
                            ))
                        }
                    }
                }
                tokens.push(Located { token: Token::String(value), line: start_line });
            }
            c if c.is_ascii_digit() || (c == '-' && peek_is_digit(&mut chars.clone())) => {
                let mut text = String::new();
                if c == '-' {
                    text.push(c);
                    chars.next();
                }
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: i64 = text
                    .parse()
                    .map_err(|_| ConfigError::new("<config>", line, format!("invalid number: {text}")))?;
                tokens.push(Located { token: Token::Number(n), line });
            }
            c if is_ident_start(c) => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if is_ident_continue(d) {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Located { token: Token::Ident(text), line });
            }
            other => {
                return Err(ConfigError::new(
                    "<config>",
                    line,
                    format!("unexpected character: {other:?}"),
                ))
            }
        }
    }

    Ok(tokens)
}

fn peek_is_digit(chars: &mut std::iter::Peekable<std::str::Chars>) -> bool {
    chars.next(); // skip the '-'
    chars.peek().is_some_and(|c| c.is_ascii_digit())
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '/' || c == '.' || c == '*' || c == '!' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit() || c == '-' || c == ':'
}

/// One `path` declaration: a bare string, or `(string, "recursive" [, depth])`.
#[derive(Debug, Clone)]
pub struct PathSpec {
    pub path: String,
    pub depth: i64,
}

/// The parsed contents of a single `watcher { ... }` block. Left mostly
/// un-interpreted (raw event/path-option strings) so the core's own
/// vocabularies (`EventTaxonomy`, `HandlerFlags`) do the actual resolution
/// and can report their own errors against the same line numbers.
#[derive(Debug, Clone, Default)]
pub struct WatcherConfig {
    pub paths: Vec<PathSpec>,
    pub events: Vec<String>,
    pub files: Vec<String>,
    pub command: Option<String>,
    pub user: Option<String>,
    pub timeout: Option<u64>,
    pub options: Vec<String>,
    pub environ: Vec<(String, String)>,
}

pub struct ConfigParser {
    file: PathBuf,
    errors: Vec<ConfigError>,
}

impl ConfigParser {
    pub fn parse_file(path: &Path) -> Result<Vec<WatcherConfig>, Vec<ConfigError>> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| vec![ConfigError::new(path, 0, format!("cannot read file: {e}"))])?;
        Self::parse_str(path, &source)
    }

    pub fn parse_str(file: &Path, source: &str) -> Result<Vec<WatcherConfig>, Vec<ConfigError>> {
        let tokens = tokenize(source).map_err(|e| vec![e])?;
        let mut parser = ConfigParser {
            file: file.to_path_buf(),
            errors: Vec::new(),
        };
        let blocks = parser.parse_tokens(&tokens);
        if parser.errors.is_empty() {
            Ok(blocks)
        } else {
            Err(parser.errors)
        }
    }

    fn error(&mut self, line: u32, message: impl Into<String>) {
        self.errors.push(ConfigError::new(self.file.clone(), line, message));
    }

    fn parse_tokens(&mut self, tokens: &[Located<Token>]) -> Vec<WatcherConfig> {
        let mut pos = 0;
        let mut blocks = Vec::new();

        while pos < tokens.len() {
            match &tokens[pos].token {
                Token::Ident(kw) if kw == "watcher" => {
                    pos += 1;
                    if !self.expect(tokens, &mut pos, Token::LBrace) {
                        continue;
                    }
                    let block = self.parse_block(tokens, &mut pos);
                    blocks.push(block);
                }
                _ => {
                    self.error(tokens[pos].line, "expected 'watcher' block at top level");
                    pos += 1;
                }
            }
        }

        blocks
    }

    fn expect(&mut self, tokens: &[Located<Token>], pos: &mut usize, expected: Token) -> bool {
        match tokens.get(*pos) {
            Some(t) if t.token == expected => {
                *pos += 1;
                true
            }
            Some(t) => {
                self.error(t.line, format!("expected {expected:?}, found {:?}", t.token));
                false
            }
            None => {
                self.error(0, format!("expected {expected:?}, found end of input"));
                false
            }
        }
    }

    fn parse_block(&mut self, tokens: &[Located<Token>], pos: &mut usize) -> WatcherConfig {
        let mut config = WatcherConfig::default();

        while let Some(located) = tokens.get(*pos) {
            match &located.token {
                Token::RBrace => {
                    *pos += 1;
                    break;
                }
                Token::Ident(kw) => {
                    let kw = kw.clone();
                    let line = located.line;
                    *pos += 1;
                    self.parse_statement(tokens, pos, &mut config, &kw, line);
                }
                other => {
                    self.error(located.line, format!("unexpected token in watcher block: {other:?}"));
                    *pos += 1;
                }
            }
        }

        config
    }

    fn parse_statement(
        &mut self,
        tokens: &[Located<Token>],
        pos: &mut usize,
        config: &mut WatcherConfig,
        keyword: &str,
        line: u32,
    ) {
        match keyword {
            "path" => {
                if let Some(spec) = self.parse_path_value(tokens, pos) {
                    config.paths.push(spec);
                }
            }
            "event" => {
                config.events.extend(self.parse_string_or_list(tokens, pos));
            }
            "file" => {
                config.files.extend(self.parse_string_or_list(tokens, pos));
            }
            "command" => {
                config.command = self.parse_single_string(tokens, pos);
            }
            "user" => {
                config.user = self.parse_single_string(tokens, pos);
            }
            "timeout" => {
                config.timeout = self.parse_single_number(tokens, pos).map(|n| n.max(0) as u64);
            }
            "option" => {
                config.options.extend(self.parse_ident_list(tokens, pos));
            }
            "environ" => {
                config.environ.extend(self.parse_environ_list(tokens, pos));
            }
            other => {
                self.error(line, format!("unknown declaration: {other}"));
            }
        }
        self.skip_to_semicolon(tokens, pos);
    }

    fn skip_to_semicolon(&mut self, tokens: &[Located<Token>], pos: &mut usize) {
        while let Some(located) = tokens.get(*pos) {
            *pos += 1;
            if located.token == Token::Semicolon {
                return;
            }
            if located.token == Token::RBrace {
                *pos -= 1; // let the block loop see the closing brace
                return;
            }
        }
    }

    fn parse_path_value(&mut self, tokens: &[Located<Token>], pos: &mut usize) -> Option<PathSpec> {
        match tokens.get(*pos) {
            Some(Located { token: Token::String(s), .. }) => {
                *pos += 1;
                Some(PathSpec { path: s.clone(), depth: 0 })
            }
            Some(Located { token: Token::LParen, .. }) => {
                *pos += 1;
                let path = match tokens.get(*pos) {
                    Some(Located { token: Token::String(s), .. }) => {
                        *pos += 1;
                        s.clone()
                    }
                    _ => {
                        self.error(tokens.get(*pos).map(|t| t.line).unwrap_or(0), "expected path string");
                        return None;
                    }
                };
                let mut depth = -1; // "recursive" with no explicit depth: unlimited
                if matches!(tokens.get(*pos).map(|t| &t.token), Some(Token::Comma)) {
                    *pos += 1;
                    self.expect_ident(tokens, pos, "recursive");
                    if matches!(tokens.get(*pos).map(|t| &t.token), Some(Token::Comma)) {
                        *pos += 1;
                        if let Some(Located { token: Token::Number(n), .. }) = tokens.get(*pos) {
                            depth = *n;
                            *pos += 1;
                        }
                    }
                }
                if matches!(tokens.get(*pos).map(|t| &t.token), Some(Token::RParen)) {
                    *pos += 1;
                } else {
                    self.error(tokens.get(*pos).map(|t| t.line).unwrap_or(0), "expected ')'");
                }
                Some(PathSpec { path, depth })
            }
            other => {
                self.error(other.map(|t| t.line).unwrap_or(0), "expected path value");
                None
            }
        }
    }

    fn expect_ident(&mut self, tokens: &[Located<Token>], pos: &mut usize, expected: &str) {
        match tokens.get(*pos) {
            Some(Located { token: Token::Ident(s), .. }) if s == expected => {
                *pos += 1;
            }
            Some(t) => self.error(t.line, format!("expected '{expected}'")),
            None => self.error(0, format!("expected '{expected}'")),
        }
    }

    fn parse_single_string(&mut self, tokens: &[Located<Token>], pos: &mut usize) -> Option<String> {
        match tokens.get(*pos) {
            Some(Located { token: Token::String(s), .. }) => {
                *pos += 1;
                Some(s.clone())
            }
            other => {
                self.error(other.map(|t| t.line).unwrap_or(0), "expected a string");
                None
            }
        }
    }

    fn parse_single_number(&mut self, tokens: &[Located<Token>], pos: &mut usize) -> Option<i64> {
        match tokens.get(*pos) {
            Some(Located { token: Token::Number(n), .. }) => {
                *pos += 1;
                Some(*n)
            }
            other => {
                self.error(other.map(|t| t.line).unwrap_or(0), "expected a number");
                None
            }
        }
    }

    /// Accepts a bare identifier/string, or a parenthesised comma-separated
    /// list of either — used by `event` and `file`.
    fn parse_string_or_list(&mut self, tokens: &[Located<Token>], pos: &mut usize) -> Vec<String> {
        match tokens.get(*pos) {
            Some(Located { token: Token::LParen, .. }) => {
                *pos += 1;
                let mut values = Vec::new();
                loop {
                    match tokens.get(*pos) {
                        Some(Located { token: Token::RParen, .. }) => {
                            *pos += 1;
                            break;
                        }
                        Some(Located { token: Token::Ident(s), .. }) => {
                            values.push(s.clone());
                            *pos += 1;
                        }
                        Some(Located { token: Token::String(s), .. }) => {
                            values.push(s.clone());
                            *pos += 1;
                        }
                        Some(Located { token: Token::Comma, .. }) => {
                            *pos += 1;
                        }
                        other => {
                            self.error(other.map(|t| t.line).unwrap_or(0), "expected ')'");
                            break;
                        }
                    }
                }
                values
            }
            Some(Located { token: Token::Ident(s), .. }) => {
                let v = vec![s.clone()];
                *pos += 1;
                v
            }
            Some(Located { token: Token::String(s), .. }) => {
                let v = vec![s.clone()];
                *pos += 1;
                v
            }
            other => {
                self.error(other.map(|t| t.line).unwrap_or(0), "expected a name or list");
                Vec::new()
            }
        }
    }

    fn parse_ident_list(&mut self, tokens: &[Located<Token>], pos: &mut usize) -> Vec<String> {
        self.parse_string_or_list(tokens, pos)
    }

    fn parse_environ_list(&mut self, tokens: &[Located<Token>], pos: &mut usize) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if !matches!(tokens.get(*pos).map(|t| &t.token), Some(Token::LParen)) {
            self.error(tokens.get(*pos).map(|t| t.line).unwrap_or(0), "expected '(' after 'environ'");
            return pairs;
        }
        *pos += 1;
        loop {
            match tokens.get(*pos) {
                Some(Located { token: Token::RParen, .. }) => {
                    *pos += 1;
                    break;
                }
                Some(Located { token: Token::Comma, .. }) => {
                    *pos += 1;
                }
                Some(Located { token: Token::Ident(key), .. }) => {
                    let key = key.clone();
                    *pos += 1;
                    if matches!(tokens.get(*pos).map(|t| &t.token), Some(Token::Equals)) {
                        *pos += 1;
                    }
                    let value = match tokens.get(*pos) {
                        Some(Located { token: Token::String(v), .. }) => {
                            let v = v.clone();
                            *pos += 1;
                            v
                        }
                        Some(Located { token: Token::Ident(v), .. }) => {
                            let v = v.clone();
                            *pos += 1;
                            v
                        }
                        _ => String::new(),
                    };
                    pairs.push((key, value));
                }
                other => {
                    self.error(other.map(|t| t.line).unwrap_or(0), "expected ')'");
                    break;
                }
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_block() {
        let source = r#"
            watcher {
                path "/tmp/t";
                event write;
                command "echo $DIREVENT_FILE";
            }
        "#;
        let blocks = ConfigParser::parse_str(Path::new("<test>"), source).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].paths[0].path, "/tmp/t");
        assert_eq!(blocks[0].events, vec!["write".to_string()]);
        assert_eq!(blocks[0].command.as_deref(), Some("echo $DIREVENT_FILE"));
    }

    #[test]
    fn parses_recursive_path_with_explicit_depth() {
        let source = r#"
            watcher {
                path ("/r", "recursive", 1);
                event (create, write);
                option (nowait, stdout);
            }
        "#;
        let blocks = ConfigParser::parse_str(Path::new("<test>"), source).unwrap();
        let spec = &blocks[0].paths[0];
        assert_eq!(spec.path, "/r");
        assert_eq!(spec.depth, 1);
        assert_eq!(blocks[0].events, vec!["create".to_string(), "write".to_string()]);
        assert_eq!(blocks[0].options, vec!["nowait".to_string(), "stdout".to_string()]);
    }

    #[test]
    fn recursive_without_explicit_depth_is_unlimited() {
        let source = r#"watcher { path ("/r", "recursive"); }"#;
        let blocks = ConfigParser::parse_str(Path::new("<test>"), source).unwrap();
        assert_eq!(blocks[0].paths[0].depth, -1);
    }

    #[test]
    fn multiple_file_statements_accumulate_patterns() {
        let source = r#"
            watcher {
                path "/w";
                file "*.rs";
                file "!/\.tmp$/";
            }
        "#;
        let blocks = ConfigParser::parse_str(Path::new("<test>"), source).unwrap();
        assert_eq!(blocks[0].files, vec!["*.rs".to_string(), "!/\\.tmp$/".to_string()]);
    }

    #[test]
    fn environ_pairs_are_parsed() {
        let source = r#"watcher { path "/w"; environ (FOO=bar, BAZ="qux quux"); }"#;
        let blocks = ConfigParser::parse_str(Path::new("<test>"), source).unwrap();
        assert_eq!(
            blocks[0].environ,
            vec![("FOO".to_string(), "bar".to_string()), ("BAZ".to_string(), "qux quux".to_string())]
        );
    }

    #[test]
    fn unknown_declaration_is_a_collected_error_not_a_hard_stop() {
        let source = r#"
            watcher {
                bogus 1;
                path "/w";
            }
        "#;
        let err = ConfigParser::parse_str(Path::new("<test>"), source).unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].message.contains("unknown declaration"));
    }

    #[test]
    fn unterminated_string_is_reported_with_its_line() {
        let source = "watcher {\n  path \"/unterminated\n}";
        let err = ConfigParser::parse_str(Path::new("<test>"), source).unwrap_err();
        assert_eq!(err[0].line, 2);
    }
}
