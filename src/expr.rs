use anyhow::{anyhow, Context, Result};
use regex::Regex;

use crate::cpu::{reg_index, CpuState};

/// Upper bound on the number of tokens in one expression.
const MAX_TOKENS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenKind {
    Number,
    HexNumber,
    Register,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Eq,
    Neq,
    And,
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    text: String,
}

enum Paren {
    /// The whole range is wrapped by one outer pair.
    Wrapped,
    NoOuterPair,
}

/// Numeric expression evaluator over literals, the four arithmetic
/// operators, comparisons, `&&` and live register references.
///
/// Comparison results follow the watchpoint convention: `0` means the
/// predicate holds, `-1` that it does not.
pub struct Evaluator {
    rules: Vec<(Regex, Option<TokenKind>)>,
}

impl Evaluator {
    pub fn new() -> Self {
        // Tried in declaration order at each position; the first rule that
        // matches at offset zero wins, so `==`/`0x..` sit ahead of the
        // rules whose prefixes they share.
        let table: &[(&str, Option<TokenKind>)] = &[
            (r"^ +", None),
            (r"^\+", Some(TokenKind::Plus)),
            (r"^==", Some(TokenKind::Eq)),
            (r"^!=", Some(TokenKind::Neq)),
            (r"^&&", Some(TokenKind::And)),
            (r"^-", Some(TokenKind::Minus)),
            (r"^\*", Some(TokenKind::Star)),
            (r"^/", Some(TokenKind::Slash)),
            (r"^\(", Some(TokenKind::LParen)),
            (r"^\)", Some(TokenKind::RParen)),
            (r"^,", Some(TokenKind::Comma)),
            (r"^\$[a-zA-Z0-9{}]+", Some(TokenKind::Register)),
            (r"^0x[0-9a-fA-F]+", Some(TokenKind::HexNumber)),
            (r"^[0-9]+", Some(TokenKind::Number)),
        ];

        let rules = table
            .iter()
            .map(|(re, kind)| (Regex::new(re).expect("tokenizer rule compiles"), *kind))
            .collect();

        Self { rules }
    }

    /// Evaluate `input` against the live CPU state.
    pub fn eval(&self, input: &str, cpu: &CpuState) -> Result<i32> {
        let mut tokens = self.tokenize(input)?;
        substitute(&mut tokens, cpu)?;

        if tokens.is_empty() {
            return Err(anyhow!("empty expression"));
        }

        eval_range(&tokens, 0, tokens.len() - 1)
    }

    fn tokenize(&self, input: &str) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut pos = 0;

        'scan: while pos < input.len() {
            for (re, kind) in &self.rules {
                if let Some(m) = re.find(&input[pos..]) {
                    let text = &input[pos..pos + m.end()];
                    pos += m.end();

                    if let Some(kind) = kind {
                        if tokens.len() == MAX_TOKENS {
                            return Err(anyhow!(
                                "expression has more than {} tokens",
                                MAX_TOKENS
                            ));
                        }
                        log::trace!("token {:?} '{}'", kind, text);
                        tokens.push(Token {
                            kind: *kind,
                            text: text.to_string(),
                        });
                    }

                    continue 'scan;
                }
            }

            return Err(anyhow!(
                "no match at position {}\n{}\n{:>width$}",
                pos,
                input,
                "^",
                width = pos + 1
            ));
        }

        Ok(tokens)
    }
}

/// Replace register and hex tokens with plain decimal number tokens, so the
/// recursion below only ever sees numbers and operators.
fn substitute(tokens: &mut Vec<Token>, cpu: &CpuState) -> Result<()> {
    for tok in tokens.iter_mut() {
        match tok.kind {
            TokenKind::Register => {
                let name = tok.text.trim_start_matches('$');
                let name = if name.starts_with('{') && name.ends_with('}') && name.len() > 2 {
                    &name[1..name.len() - 1]
                } else {
                    name
                };
                let idx = reg_index(name)
                    .ok_or_else(|| anyhow!("unknown register '{}'", tok.text))?;
                tok.text = cpu.gpr[idx].to_string();
                tok.kind = TokenKind::Number;
            }
            TokenKind::HexNumber => {
                let val = u32::from_str_radix(&tok.text[2..], 16)
                    .with_context(|| format!("hex literal '{}' out of range", tok.text))?;
                tok.text = val.to_string();
                tok.kind = TokenKind::Number;
            }
            _ => {}
        }
    }

    Ok(())
}

fn check_parentheses(tokens: &[Token], lo: usize, hi: usize) -> Result<Paren> {
    let mut depth = 0i32;
    for tok in &tokens[lo..=hi] {
        match tok.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Err(anyhow!("unbalanced parentheses"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(anyhow!("unbalanced parentheses"));
    }

    if tokens[lo].kind == TokenKind::LParen && tokens[hi].kind == TokenKind::RParen {
        // Wrapped iff the opening paren stays open until `hi`.
        let mut depth = 0i32;
        let mut wrapped = true;
        for tok in &tokens[lo..hi] {
            match tok.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        wrapped = false;
                        break;
                    }
                }
                _ => {}
            }
        }
        if wrapped {
            return Ok(Paren::Wrapped);
        }
    }

    Ok(Paren::NoOuterPair)
}

fn precedence(kind: TokenKind) -> Option<u32> {
    match kind {
        TokenKind::And => Some(0),
        TokenKind::Eq | TokenKind::Neq => Some(1),
        TokenKind::Plus | TokenKind::Minus => Some(2),
        TokenKind::Star | TokenKind::Slash => Some(3),
        _ => None,
    }
}

/// Find the operator that splits `[lo, hi]`: the lowest-precedence operator
/// outside any parentheses, ties going to the rightmost occurrence.
fn find_main_op(tokens: &[Token], lo: usize, hi: usize) -> Result<usize> {
    let mut depth = 0i32;
    let mut best: Option<(usize, u32)> = None;

    for (i, tok) in tokens.iter().enumerate().take(hi + 1).skip(lo) {
        match tok.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            kind => {
                if depth == 0 {
                    if let Some(p) = precedence(kind) {
                        if best.map_or(true, |(_, bp)| p <= bp) {
                            best = Some((i, p));
                        }
                    }
                }
            }
        }
    }

    best.map(|(i, _)| i).ok_or_else(|| anyhow!("bad expression"))
}

fn eval_range(tokens: &[Token], lo: usize, hi: usize) -> Result<i32> {
    if lo > hi {
        return Err(anyhow!("bad expression"));
    }

    if lo == hi {
        let tok = &tokens[lo];
        if tok.kind != TokenKind::Number {
            return Err(anyhow!("bad expression: expected a number, found '{}'", tok.text));
        }
        let val = tok
            .text
            .parse::<u32>()
            .with_context(|| format!("literal '{}' out of range", tok.text))?;
        return Ok(val as i32);
    }

    if let Paren::Wrapped = check_parentheses(tokens, lo, hi)? {
        return eval_range(tokens, lo + 1, hi - 1);
    }

    let op = find_main_op(tokens, lo, hi)?;
    if op == lo || op == hi {
        return Err(anyhow!("bad expression"));
    }

    if tokens[op].kind == TokenKind::And {
        // Short-circuit: a failed left side decides the conjunction.
        let lval = eval_range(tokens, lo, op - 1)?;
        if lval != 0 {
            return Ok(-1);
        }
        let rval = eval_range(tokens, op + 1, hi)?;
        return Ok(if rval == 0 { 0 } else { -1 });
    }

    let lval = eval_range(tokens, lo, op - 1)?;
    let rval = eval_range(tokens, op + 1, hi)?;

    match tokens[op].kind {
        TokenKind::Plus => Ok(lval.wrapping_add(rval)),
        TokenKind::Minus => Ok(lval.wrapping_sub(rval)),
        TokenKind::Star => Ok(lval.wrapping_mul(rval)),
        TokenKind::Slash => {
            if rval == 0 {
                Err(anyhow!("division by zero"))
            } else {
                Ok(lval.wrapping_div(rval))
            }
        }
        TokenKind::Eq => Ok(if lval == rval { 0 } else { -1 }),
        TokenKind::Neq => Ok(if lval != rval { 0 } else { -1 }),
        _ => Err(anyhow!("bad expression")),
    }
}
