//! Signature definition language compiler
//!
//! Grammar:
//!
//! ```text
//! [var] $name = "pattern"
//! sig "name" {
//!     (tcp|smtp|imf) : (open|close|reset|"pattern") ; [^][=]
//! }
//! ```
//!
//! Macros are referenced inside patterns as `$name$` and replaced by
//! their definition. A macro declared with the `var` keyword is a
//! variable: every replacement site is wrapped in a fresh capture
//! group and all sites of the same variable must capture identical
//! text at match time. Quoted fragments may be split across lines and
//! joined with `+`. A `^` suffix groups a statement with the previous
//! one, `=` binds it to the previous statement's mail transaction.
//!
//! Macros and variables declared in a file apply to every signature
//! in that file; global macros come from a shared macro file and may
//! be overridden locally.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag_no_case, take_while1},
    character::complete::{anychar, char, multispace0, multispace1},
    combinator::{map, opt, recognize},
    multi::{many0, many1, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use thiserror::Error;
use tracing::{debug, warn};

use super::model::{Link, Signature, TcpEvent};

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid signature {name:?}: {reason}")]
    Invalid { name: String, reason: String },
    #[error("signature grammar error: {0}")]
    Grammar(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Tcp,
    Smtp,
    Imf,
}

#[derive(Debug, Clone)]
enum RawBody {
    Event(TcpEvent),
    Pattern(String),
}

#[derive(Debug, Clone)]
struct RawStatement {
    protocol: Protocol,
    body: RawBody,
    grouped: bool,
    same_transaction: bool,
}

#[derive(Debug, Clone)]
enum Item {
    Macro { is_var: bool, name: String, value: String },
    Sig { name: String, statements: Vec<RawStatement> },
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-')(input)
}

/// Quoted text; backslash escapes the next character.
fn string_fragment(input: &str) -> IResult<&str, &str> {
    delimited(
        char('"'),
        recognize(many0(alt((is_not("\\\""), recognize(pair(char('\\'), anychar)))))),
        char('"'),
    )(input)
}

/// One or more quoted fragments joined with `+`.
fn pattern_expr(input: &str) -> IResult<&str, String> {
    map(
        separated_list1(delimited(multispace0, char('+'), multispace0), string_fragment),
        |fragments| fragments.concat(),
    )(input)
}

fn tcp_event(input: &str) -> IResult<&str, TcpEvent> {
    alt((
        map(tag_no_case("open"), |_| TcpEvent::Open),
        map(tag_no_case("close"), |_| TcpEvent::Close),
        map(tag_no_case("reset"), |_| TcpEvent::Reset),
    ))(input)
}

fn statement(input: &str) -> IResult<&str, RawStatement> {
    let (input, _) = multispace0(input)?;
    let (input, protocol) = alt((
        map(tag_no_case("tcp"), |_| Protocol::Tcp),
        map(tag_no_case("smtp"), |_| Protocol::Smtp),
        map(tag_no_case("imf"), |_| Protocol::Imf),
    ))(input)?;
    let (input, _) = delimited(multispace0, char(':'), multispace0)(input)?;
    let (input, body) = alt((
        map(terminated(tcp_event, preceded(multispace0, char(';'))), RawBody::Event),
        map(terminated(pattern_expr, preceded(multispace0, char(';'))), RawBody::Pattern),
    ))(input)?;
    let (input, grouped) = map(opt(char('^')), |c| c.is_some())(input)?;
    let (input, same_transaction) = map(opt(char('=')), |c| c.is_some())(input)?;
    Ok((input, RawStatement { protocol, body, grouped, same_transaction }))
}

fn sig_block(input: &str) -> IResult<&str, Item> {
    let (input, _) = multispace0(input)?;
    let (input, _) = tag_no_case("sig")(input)?;
    let (input, name) = preceded(multispace0, delimited(char('"'), identifier, char('"')))(input)?;
    let (input, _) = preceded(multispace0, char('{'))(input)?;
    let (input, statements) = many1(statement)(input)?;
    let (input, _) = preceded(multispace0, char('}'))(input)?;
    Ok((input, Item::Sig { name: name.to_string(), statements }))
}

fn macro_def(input: &str) -> IResult<&str, Item> {
    let (input, _) = multispace0(input)?;
    let (input, is_var) = map(opt(terminated(tag_no_case("var"), multispace1)), |v| v.is_some())(input)?;
    let (input, _) = char('$')(input)?;
    let (input, name) = identifier(input)?;
    let (input, _) = delimited(multispace0, char('='), multispace0)(input)?;
    let (input, value) = string_fragment(input)?;
    Ok((
        input,
        Item::Macro { is_var, name: name.to_string(), value: value.to_string() },
    ))
}

fn items(input: &str) -> IResult<&str, Vec<Item>> {
    terminated(many0(alt((macro_def, sig_block))), multispace0)(input)
}

/// Capture group ordinal a `(` appended to `prefix` would get: one
/// more than the unescaped `(` already open outside character
/// classes. Escapes and `[...]` classes are honored.
fn count_group_opens(prefix: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    let mut in_class = false;
    for ch in prefix.chars() {
        if ch == '\\' {
            escaped = true;
        } else if ch == '[' && !escaped {
            in_class = true;
        } else if ch == ']' && !escaped {
            in_class = false;
        } else {
            if ch == '(' && !escaped && !in_class {
                count += 1;
            }
            escaped = false;
        }
    }
    count
}

/// Replace `$name$` references. Variable sites are wrapped in a
/// capture group and recorded as links; unknown references are left
/// in place. Inserted values are not rescanned.
fn substitute(
    input: &str,
    macros: &HashMap<String, String>,
    variables: &mut HashMap<String, Option<usize>>,
    next_slot: &mut usize,
    links: &mut Vec<Link>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let Some(off) = input[i..].find('$') else {
            out.push_str(&input[i..]);
            break;
        };
        out.push_str(&input[i..i + off]);
        let dollar = i + off;
        let rest = &input[dollar + 1..];
        let name_len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(rest.len());
        let name = &rest[..name_len];
        if name.is_empty() || !rest[name_len..].starts_with('$') {
            out.push('$');
            i = dollar + 1;
            continue;
        }
        match macros.get(name) {
            Some(value) if variables.contains_key(name) => {
                let group = 1 + count_group_opens(&out);
                out.push('(');
                out.push_str(value);
                out.push(')');
                let slot = match variables.get(name) {
                    Some(Some(slot)) => *slot,
                    _ => {
                        let slot = *next_slot;
                        variables.insert(name.to_string(), Some(slot));
                        *next_slot += 1;
                        slot
                    }
                };
                links.push(Link { group, slot });
            }
            Some(value) => out.push_str(value),
            None => {
                warn!(name, "unknown macro reference left in place");
                out.push('$');
                i = dollar + 1;
                continue;
            }
        }
        i = dollar + 1 + name_len + 1;
    }
    out
}

fn as_event(text: &str) -> Option<TcpEvent> {
    if text.eq_ignore_ascii_case("open") {
        Some(TcpEvent::Open)
    } else if text.eq_ignore_ascii_case("close") {
        Some(TcpEvent::Close)
    } else if text.eq_ignore_ascii_case("reset") {
        Some(TcpEvent::Reset)
    } else {
        None
    }
}

fn event_word(event: TcpEvent) -> &'static str {
    match event {
        TcpEvent::Open => "open",
        TcpEvent::Close => "close",
        TcpEvent::Reset => "reset",
    }
}

/// Compiles signature definition files against a shared set of global
/// macros.
#[derive(Debug, Default)]
pub struct SignatureCompiler {
    globals: HashMap<String, String>,
}

impl SignatureCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load global macro definitions. A missing file is logged and
    /// skipped.
    pub fn load_macro_file(&mut self, path: &Path) -> Result<(), SignatureError> {
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                warn!(path = %path.display(), %err, "macro definition file not loaded");
                return Ok(());
            }
        };
        self.load_macros(&source)
    }

    /// Register global macros from source text. Values may reference
    /// macros defined earlier; the `var` keyword has no effect at
    /// global scope.
    pub fn load_macros(&mut self, source: &str) -> Result<(), SignatureError> {
        let (_, defs) = many0(macro_def)(source)
            .map_err(|e| SignatureError::Grammar(format!("{e:?}")))?;
        for def in defs {
            if let Item::Macro { name, value, .. } = def {
                let expanded =
                    substitute(&value, &self.globals, &mut HashMap::new(), &mut 0, &mut Vec::new());
                self.globals.insert(name, expanded);
            }
        }
        Ok(())
    }

    /// Compile one signature file. A missing file is logged and
    /// yields no signatures; an invalid signature is logged and
    /// skipped while the rest of the file still loads.
    pub fn compile_file(&self, path: &Path) -> Result<Vec<Signature>, SignatureError> {
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                warn!(path = %path.display(), %err, "signature file not found, running anyway");
                return Ok(Vec::new());
            }
        };
        let signatures = self.compile_source(&source, Some(path))?;
        debug!(
            path = %path.display(),
            count = signatures.len(),
            "signatures extracted"
        );
        Ok(signatures)
    }

    /// Compile signature definitions from source text.
    pub fn compile(&self, source: &str) -> Result<Vec<Signature>, SignatureError> {
        self.compile_source(source, None)
    }

    fn compile_source(
        &self,
        source: &str,
        origin: Option<&Path>,
    ) -> Result<Vec<Signature>, SignatureError> {
        if source.is_empty() {
            return Ok(Vec::new());
        }
        let (rest, parsed) =
            items(source).map_err(|e| SignatureError::Grammar(format!("{e:?}")))?;
        if !rest.trim().is_empty() {
            return Err(SignatureError::Grammar(format!(
                "unexpected trailing content: {:.40}",
                rest.trim_start()
            )));
        }

        // locals override globals; both apply to the whole file
        let mut macros = self.globals.clone();
        let mut variables: HashMap<String, Option<usize>> = HashMap::new();
        for item in &parsed {
            if let Item::Macro { is_var, name, value } = item {
                let expanded =
                    substitute(value, &macros, &mut HashMap::new(), &mut 0, &mut Vec::new());
                if *is_var {
                    variables.insert(name.clone(), None);
                }
                macros.insert(name.clone(), expanded);
            }
        }

        let mut signatures = Vec::new();
        'sigs: for item in parsed {
            let Item::Sig { name, statements } = item else { continue };
            // variable bindings do not carry over between signatures
            for slot in variables.values_mut() {
                *slot = None;
            }
            let mut next_slot = 0usize;
            let mut sig = Signature::new(&name);
            for raw in statements {
                let text = match raw.body {
                    RawBody::Event(event) => event_word(event).to_string(),
                    RawBody::Pattern(text) => text,
                };
                if raw.protocol == Protocol::Tcp {
                    if let Some(event) = as_event(&text) {
                        sig.require_tcp(event);
                        continue;
                    }
                }
                let mut links = Vec::new();
                let pattern =
                    substitute(&text, &macros, &mut variables, &mut next_slot, &mut links);
                if let Err(err) =
                    sig.add_statement(&pattern, links, raw.grouped, raw.same_transaction)
                {
                    // reject this signature only, the rest of the file loads
                    match origin {
                        Some(path) => {
                            warn!(path = %path.display(), signature = %name, %err, "signature rejected")
                        }
                        None => warn!(signature = %name, %err, "signature rejected"),
                    }
                    continue 'sigs;
                }
            }
            if !sig.is_empty() {
                debug!(name = sig.name(), statements = sig.len(), "signature compiled");
                signatures.push(sig);
            }
        }
        Ok(signatures)
    }
}
