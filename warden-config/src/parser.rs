//! Recursive descent parser for the policy language.
//!
//! The grammar is a brace structured declaration list:
//!
//! ```text
//! file    := decl+
//! decl    := KEY '(' arglist? ')' body?
//! body    := '{' ( decl* | item (',' item)* ) '}'
//! arglist := item (',' item)*
//! ```
//!
//! Declarations the engine does not know are tolerated as long as they are
//! well formed: at the top level (and inside ASG bodies) they are dropped,
//! inside a rule body they mark the enclosing rule as ignored. Malformed
//! input and abuse of *known* elements fail the load.

use std::fmt::Display;
use std::iter::Peekable;

use lazy_static::lazy_static;
use regex::Regex;

use warden_api_types::{AccessRights, Error, Protocol};

use crate::lexer::{keyword, Keyword, Lexer, Token};
use crate::policy::{Rule, RuleCalc, SecurityBase};

lazy_static! {
    static ref INPUT_KEYWORD: Regex = Regex::new("^INP([A-L])$").unwrap();
}

enum ArgValue {
    Word(String),
    Quoted(String),
}

impl ArgValue {
    fn text(&self) -> &str {
        match self {
            ArgValue::Word(text) => text,
            ArgValue::Quoted(text) => text,
        }
    }

    fn into_text(self) -> String {
        match self {
            ArgValue::Word(text) => text,
            ArgValue::Quoted(text) => text,
        }
    }
}

pub struct PolicyParser<'a> {
    input: Peekable<Lexer<'a>>,
    line: usize,
}

impl<'a> PolicyParser<'a> {
    /// Parse `text` into `base`. On error `base` is left partially filled
    /// and must be discarded by the caller.
    pub fn parse(text: &'a str, base: &mut SecurityBase) -> Result<(), Error> {
        let mut parser = Self {
            input: Lexer::new(text).peekable(),
            line: 1,
        };
        parser.parse_file(base)
    }

    fn bad(&self, msg: impl Display) -> Error {
        Error::BadConfig(format!("line {}: {}", self.line, msg))
    }

    fn peek(&mut self) -> Result<Token, Error> {
        match self.input.peek() {
            Some(Ok((token, _, _))) => Ok(*token),
            Some(Err(msg)) => Err(Error::BadConfig(msg.clone())),
            None => Err(self.bad("unexpected end of input")),
        }
    }

    fn next(&mut self) -> Result<(Token, String), Error> {
        match self.input.next() {
            Some(Ok((token, text, line))) => {
                self.line = line;
                Ok((token, text))
            }
            Some(Err(msg)) => Err(Error::BadConfig(msg)),
            None => Err(self.bad("unexpected end of input")),
        }
    }

    fn eat(&mut self, expected: Token) -> Result<String, Error> {
        let (token, text) = self.next()?;
        if token != expected {
            return Err(self.bad(format!("expected {:?}, got '{}'", expected, text)));
        }
        Ok(text)
    }

    fn parse_file(&mut self, base: &mut SecurityBase) -> Result<(), Error> {
        let mut decls = 0;
        loop {
            match self.peek()? {
                Token::Eof => break,
                Token::Word => {
                    let (_, name) = self.next()?;
                    decls += 1;
                    match keyword(&name) {
                        Some(Keyword::Uag) => self.parse_uag(base)?,
                        Some(Keyword::Hag) => self.parse_hag(base)?,
                        Some(Keyword::Authority) => self.parse_authority(base, None)?,
                        Some(Keyword::Asg) => self.parse_asg(base)?,
                        // anything else is an unknown declaration; accept it
                        // if well formed, keep none of it
                        _ => self.skip_decl()?,
                    }
                }
                _ => {
                    let (_, text) = self.next()?;
                    return Err(self.bad(format!("expected a declaration, got '{}'", text)));
                }
            }
        }
        if decls == 0 {
            return Err(self.bad("empty configuration"));
        }
        Ok(())
    }

    /// Comma separated argument list including the parentheses. An empty
    /// list `()` is legal.
    fn parse_arg_list(&mut self) -> Result<Vec<ArgValue>, Error> {
        self.eat(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek()? == Token::RParen {
            self.next()?;
            return Ok(args);
        }
        loop {
            let (token, text) = self.next()?;
            match token {
                Token::Word => args.push(ArgValue::Word(text)),
                Token::Quoted => args.push(ArgValue::Quoted(text)),
                _ => return Err(self.bad(format!("expected an argument, got '{}'", text))),
            }
            let (token, text) = self.next()?;
            match token {
                Token::Comma => continue,
                Token::RParen => break,
                _ => return Err(self.bad(format!("expected ',' or ')', got '{}'", text))),
            }
        }
        Ok(args)
    }

    /// Comma separated list body including the braces. Used for `UAG` and
    /// `HAG`, whose bodies are declared list-only: a nested declaration in
    /// here is a hard error, not future-proof-tolerated.
    fn parse_list_body(&mut self) -> Result<Vec<String>, Error> {
        self.eat(Token::LBrace)?;
        let mut items = Vec::new();
        if self.peek()? == Token::RBrace {
            self.next()?;
            return Ok(items);
        }
        loop {
            let (token, text) = self.next()?;
            match token {
                Token::Word | Token::Quoted => {
                    if self.peek()? == Token::LParen {
                        return Err(self.bad(format!(
                            "declaration '{}' inside a list-only body",
                            text
                        )));
                    }
                    items.push(text);
                }
                _ => return Err(self.bad(format!("expected a list item, got '{}'", text))),
            }
            let (token, text) = self.next()?;
            match token {
                Token::Comma => continue,
                Token::RBrace => break,
                _ => return Err(self.bad(format!("expected ',' or '}}', got '{}'", text))),
            }
        }
        Ok(items)
    }

    /// Skip over an unknown declaration whose name was already consumed.
    /// The declaration must still be well formed: an arg list, optionally
    /// followed by a body holding either a plain list or further
    /// declarations, arbitrarily nested.
    fn skip_decl(&mut self) -> Result<(), Error> {
        self.parse_arg_list()?;
        if self.peek()? == Token::LBrace {
            self.skip_body()?;
        }
        Ok(())
    }

    fn skip_body(&mut self) -> Result<(), Error> {
        self.eat(Token::LBrace)?;
        if self.peek()? == Token::RBrace {
            self.next()?;
            return Ok(());
        }

        let (token, text) = self.next()?;
        if token != Token::Word && token != Token::Quoted {
            return Err(self.bad(format!(
                "expected a list item or declaration, got '{}'",
                text
            )));
        }

        if token == Token::Word && self.peek()? == Token::LParen {
            // a body of nested declarations
            self.skip_decl()?;
            loop {
                let (token, text) = self.next()?;
                match token {
                    Token::RBrace => break,
                    Token::Word => self.skip_decl()?,
                    _ => {
                        return Err(self.bad(format!(
                            "expected a declaration or '}}', got '{}'",
                            text
                        )))
                    }
                }
            }
            return Ok(());
        }

        // a plain list; mixing in a declaration is malformed
        loop {
            let (token, text) = self.next()?;
            match token {
                Token::RBrace => break,
                Token::Comma => {
                    let (token, text) = self.next()?;
                    if token != Token::Word && token != Token::Quoted {
                        return Err(self.bad(format!("expected a list item, got '{}'", text)));
                    }
                    if self.peek()? == Token::LParen {
                        return Err(self
                            .bad(format!("declaration '{}' mixed into a list body", text)));
                    }
                }
                _ => return Err(self.bad(format!("expected ',' or '}}', got '{}'", text))),
            }
        }
        Ok(())
    }

    fn single_name(&self, what: &str, args: Vec<ArgValue>) -> Result<String, Error> {
        if args.len() != 1 {
            return Err(self.bad(format!("{} takes a single name argument", what)));
        }
        Ok(args.into_iter().next().unwrap().into_text())
    }

    fn parse_uag(&mut self, base: &mut SecurityBase) -> Result<(), Error> {
        let args = self.parse_arg_list()?;
        let name = self.single_name("UAG", args)?;
        let uag = base.uag_add(&name)?;
        if self.peek()? == Token::LBrace {
            for user in self.parse_list_body()? {
                base.uag_add_user(uag, user);
            }
        }
        Ok(())
    }

    fn parse_hag(&mut self, base: &mut SecurityBase) -> Result<(), Error> {
        let args = self.parse_arg_list()?;
        let name = self.single_name("HAG", args)?;
        let hag = base.hag_add(&name)?;
        if self.peek()? == Token::LBrace {
            for host in self.parse_list_body()? {
                base.hag_add_host(hag, &host);
            }
        }
        Ok(())
    }

    /// `AUTHORITY(name, "common name")` or `AUTHORITY("common name")`; each
    /// nested declaration inherits the chain of its parents.
    fn parse_authority(
        &mut self,
        base: &mut SecurityBase,
        parent_chain: Option<&str>,
    ) -> Result<(), Error> {
        let args = self.parse_arg_list()?;
        let (name, common_name) = match args.len() {
            1 => (args[0].text().to_string(), args[0].text().to_string()),
            2 => (args[0].text().to_string(), args[1].text().to_string()),
            _ => return Err(self.bad("AUTHORITY takes a name and a common name")),
        };
        let chain = match parent_chain {
            Some(parent) => format!("{}\n{}", parent, common_name),
            None => common_name,
        };
        base.authority_add(&name, &chain)?;
        if self.peek()? == Token::LBrace {
            self.eat(Token::LBrace)?;
            loop {
                let (token, text) = self.next()?;
                match token {
                    Token::RBrace => break,
                    Token::Word if keyword(&text) == Some(Keyword::Authority) => {
                        self.parse_authority(base, Some(&chain))?;
                    }
                    _ => {
                        return Err(self.bad(format!(
                            "expected a nested AUTHORITY, got '{}'",
                            text
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn parse_asg(&mut self, base: &mut SecurityBase) -> Result<(), Error> {
        let args = self.parse_arg_list()?;
        let name = self.single_name("ASG", args)?;
        let asg = base.asg_add(&name)?;
        if self.peek()? != Token::LBrace {
            return Ok(());
        }
        self.eat(Token::LBrace)?;
        loop {
            let (token, text) = self.next()?;
            match token {
                Token::RBrace => break,
                Token::Word => {
                    if let Some(caps) = INPUT_KEYWORD.captures(&text) {
                        let index = (caps[1].as_bytes()[0] - b'A') as usize;
                        let args = self.parse_arg_list()?;
                        let source = self.single_name(&text, args)?;
                        base.asg_add_input(asg, index, source);
                    } else if keyword(&text) == Some(Keyword::Rule) {
                        let rule = self.parse_rule(base)?;
                        base.asgs[asg].rules.push(rule);
                    } else {
                        // future proofing: unknown group level declarations
                        // are dropped
                        self.skip_decl()?;
                    }
                }
                _ => {
                    return Err(self.bad(format!(
                        "expected a declaration inside ASG body, got '{}'",
                        text
                    )))
                }
            }
        }
        Ok(())
    }

    /// `RULE(level, permission [, TRAPWRITE|NOTRAPWRITE]) [ { predicates } ]`
    ///
    /// An unknown permission taints the rule but keeps the file loadable; a
    /// malformed level or an unknown trap option is a configuration error.
    fn parse_rule(&mut self, base: &mut SecurityBase) -> Result<Rule, Error> {
        let args = self.parse_arg_list()?;
        if args.len() < 2 || args.len() > 3 {
            return Err(self.bad("RULE takes (level, permission [, trap option])"));
        }

        let level: i32 = match &args[0] {
            ArgValue::Word(word) => word
                .parse()
                .map_err(|_| self.bad(format!("rule level '{}' is not an integer", word)))?,
            ArgValue::Quoted(_) => return Err(self.bad("rule level must be an integer")),
        };

        let mut rule = Rule::new(AccessRights::None, level);
        match args[1].text().parse::<AccessRights>() {
            Ok(access) => rule.access = access,
            Err(_) => {
                log::warn!("unknown permission '{}', rule ignored", args[1].text());
                rule.ignore = true;
            }
        }

        match args.get(2).map(ArgValue::text) {
            None => {}
            Some("TRAPWRITE") => rule.trap = true,
            Some("NOTRAPWRITE") => rule.trap = false,
            Some(other) => {
                return Err(self.bad(format!("unknown rule option '{}'", other)));
            }
        }

        if self.peek()? == Token::LBrace {
            self.parse_rule_body(base, &mut rule)?;
        }
        Ok(rule)
    }

    fn parse_rule_body(&mut self, base: &mut SecurityBase, rule: &mut Rule) -> Result<(), Error> {
        self.eat(Token::LBrace)?;
        loop {
            let (token, text) = self.next()?;
            match token {
                Token::RBrace => break,
                Token::Word => self.parse_rule_predicate(base, rule, &text)?,
                _ => {
                    return Err(self.bad(format!(
                        "expected a predicate inside RULE body, got '{}'",
                        text
                    )))
                }
            }
        }
        Ok(())
    }

    fn parse_rule_predicate(
        &mut self,
        base: &mut SecurityBase,
        rule: &mut Rule,
        name: &str,
    ) -> Result<(), Error> {
        match keyword(name) {
            Some(Keyword::Uag) => {
                for arg in self.names("UAG")? {
                    if base.uag_exists(&arg) {
                        rule.uags.push(arg);
                    } else {
                        log::warn!("no user access group named '{}', rule ignored", arg);
                        rule.ignore = true;
                    }
                }
            }
            Some(Keyword::Hag) => {
                for arg in self.names("HAG")? {
                    if base.hag_exists(&arg) {
                        rule.hags.push(arg);
                    } else {
                        log::warn!("no host access group named '{}', rule ignored", arg);
                        rule.ignore = true;
                    }
                }
            }
            Some(Keyword::Method) => {
                for arg in self.names("METHOD")? {
                    if rule.methods.iter().any(|m| *m == arg) {
                        return Err(Error::DupMethod(arg));
                    }
                    rule.methods.push(arg);
                }
            }
            Some(Keyword::Authority) => {
                // names are resolved lazily at evaluation time; an undefined
                // authority is a miss, not a load error
                for arg in self.names("AUTHORITY")? {
                    if rule.authorities.iter().any(|a| *a == arg) {
                        return Err(Error::DupAuthority(arg));
                    }
                    rule.authorities.push(arg);
                }
            }
            Some(Keyword::Protocol) => {
                let args = self.parse_arg_list()?;
                if args.len() != 1 {
                    return Err(self.bad("PROTOCOL takes a single value"));
                }
                match Protocol::from_config_token(args[0].text()) {
                    Some(protocol) => rule.protocol = Some(protocol),
                    None => {
                        log::warn!("unknown protocol '{}', rule ignored", args[0].text());
                        rule.ignore = true;
                    }
                }
            }
            Some(Keyword::Calc) => {
                let args = self.parse_arg_list()?;
                if args.len() != 1 {
                    return Err(self.bad("CALC takes a single expression"));
                }
                let source = args.into_iter().next().unwrap().into_text();
                let program = warden_calc::compile(&source)
                    .map_err(|err| Error::BadCalc(format!("'{}': {}", source, err)))?;
                rule.calc = Some(RuleCalc {
                    inp_used: program.args_used(),
                    program,
                    source,
                });
            }
            _ => {
                // unknown predicate: skip it, but the rule can no longer be
                // trusted to mean what the author intended
                self.skip_decl()?;
                rule.ignore = true;
            }
        }
        Ok(())
    }

    /// Argument list of at least one name, as used by the predicate lists.
    fn names(&mut self, what: &str) -> Result<Vec<String>, Error> {
        let args = self.parse_arg_list()?;
        if args.is_empty() {
            return Err(self.bad(format!("{} needs at least one argument", what)));
        }
        Ok(args.into_iter().map(ArgValue::into_text).collect())
    }
}
