use std::collections::HashMap;
use std::iter::Iterator;
use std::str::Chars;

use lazy_static::lazy_static;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Token {
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    /// A double quoted string, text delivered without the quotes.
    Quoted,
    /// Bare word: identifier or number. Policy identifiers may contain
    /// colons, dots, dashes and similar punctuation, so everything up to
    /// whitespace or a structural character belongs to the word.
    Word,
    Eof,
}

/// Declaration keywords the parser gives meaning to. Everything else is
/// handled by the future-proofing skip path.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Keyword {
    Uag,
    Hag,
    Asg,
    Authority,
    Rule,
    Calc,
    Method,
    Protocol,
}

lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, Keyword> = {
        let mut map = HashMap::new();
        map.insert("UAG", Keyword::Uag);
        map.insert("HAG", Keyword::Hag);
        map.insert("ASG", Keyword::Asg);
        map.insert("AUTHORITY", Keyword::Authority);
        map.insert("RULE", Keyword::Rule);
        map.insert("CALC", Keyword::Calc);
        map.insert("METHOD", Keyword::Method);
        map.insert("PROTOCOL", Keyword::Protocol);
        map
    };
}

pub fn keyword(text: &str) -> Option<Keyword> {
    KEYWORDS.get(text).copied()
}

fn is_structural(c: char) -> bool {
    matches!(c, '(' | ')' | '{' | '}' | ',' | '"' | '#')
}

/// Tokenizer for the policy language. Yields `(token, text, line)` tuples;
/// lexical errors are reported as a ready made message including the line
/// number.
pub struct Lexer<'a> {
    input: Chars<'a>,
    pending: Option<char>,
    line: usize,
    eof_count: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.chars(),
            pending: None,
            line: 1,
            eof_count: 0,
        }
    }

    fn getc(&mut self) -> Option<char> {
        let c = match self.pending.take() {
            Some(c) => Some(c),
            None => self.input.next(),
        };
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    fn ungetc(&mut self, c: char) {
        if c == '\n' {
            self.line -= 1;
        }
        self.pending = Some(c);
    }

    fn lex_quoted(&mut self) -> Result<(Token, String, usize), String> {
        let line = self.line;
        let mut text = String::new();
        loop {
            match self.getc() {
                Some('"') => return Ok((Token::Quoted, text, line)),
                Some('\n') | None => {
                    return Err(format!("line {}: unterminated string", line));
                }
                Some(c) => text.push(c),
            }
        }
    }

    fn lex_word(&mut self, first: char) -> (Token, String, usize) {
        let line = self.line;
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.getc() {
            if c.is_whitespace() || is_structural(c) {
                self.ungetc(c);
                break;
            }
            text.push(c);
        }
        (Token::Word, text, line)
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<(Token, String, usize), String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let c = match self.getc() {
                Some(c) => c,
                None => {
                    self.eof_count += 1;
                    if self.eof_count == 1 {
                        return Some(Ok((Token::Eof, String::new(), self.line)));
                    }
                    return None;
                }
            };
            if c.is_whitespace() {
                continue;
            }
            if c == '#' {
                // comment runs to end of line
                for c in self.input.by_ref() {
                    if c == '\n' {
                        self.line += 1;
                        break;
                    }
                }
                continue;
            }
            let token = match c {
                '(' => (Token::LParen, c.to_string(), self.line),
                ')' => (Token::RParen, c.to_string(), self.line),
                '{' => (Token::LBrace, c.to_string(), self.line),
                '}' => (Token::RBrace, c.to_string(), self.line),
                ',' => (Token::Comma, c.to_string(), self.line),
                '"' => match self.lex_quoted() {
                    Ok(token) => token,
                    Err(err) => {
                        self.eof_count += 1; // stop iteration after the error
                        return Some(Err(err));
                    }
                },
                _ => self.lex_word(c),
            };
            return Some(Ok(token));
        }
    }
}
