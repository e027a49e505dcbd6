use rand::Rng;
use rand::seq::IndexedRandom;
use time::OffsetDateTime;
use time::macros::format_description;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Int(i64, i64),
    Choice(Vec<String>),
    Now,
}

/// Text with `{int:A-B}`, `{choice:a|b}` and `{now}` placeholders. Any
/// other brace is literal, so JSON bodies need no escaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pieces: Vec<Piece>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut rest = text;
        while let Some(start) = rest.find('{') {
            literal.push_str(&rest[..start]);
            let tail = &rest[start..];
            match parse_placeholder(tail)? {
                Some((piece, used)) => {
                    if !literal.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut literal)));
                    }
                    pieces.push(piece);
                    rest = &tail[used..];
                }
                None => {
                    literal.push('{');
                    rest = &tail[1..];
                }
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            pieces.push(Piece::Text(literal));
        }
        Ok(Self { pieces })
    }

    pub fn expand<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(s) => out.push_str(s),
                Piece::Int(lo, hi) => out.push_str(&rng.random_range(*lo..=*hi).to_string()),
                Piece::Choice(options) => {
                    if let Some(choice) = options.choose(rng) {
                        out.push_str(choice);
                    }
                }
                Piece::Now => out.push_str(&now_stamp()),
            }
        }
        out
    }
}

fn parse_placeholder(tail: &str) -> Result<Option<(Piece, usize)>, String> {
    let Some(end) = tail.find('}') else {
        return Ok(None);
    };
    let inner = &tail[1..end];
    let used = end + 1;
    if inner == "now" {
        return Ok(Some((Piece::Now, used)));
    }
    if let Some(range) = inner.strip_prefix("int:") {
        let (lo, hi) = parse_range(range)?;
        return Ok(Some((Piece::Int(lo, hi), used)));
    }
    if let Some(list) = inner.strip_prefix("choice:") {
        let options: Vec<String> = list.split('|').map(|s| s.to_string()).collect();
        if options.iter().any(String::is_empty) {
            return Err(format!("{{choice:...}} に空の候補があります: {inner}"));
        }
        return Ok(Some((Piece::Choice(options), used)));
    }
    Ok(None)
}

/// `A-B` with A <= B, or a single `N`.
pub fn parse_range(s: &str) -> Result<(i64, i64), String> {
    let s = s.trim();
    let invalid = || format!("範囲の形式が不正です: {s}（例: 1-5）");
    let (lo, hi) = match s.split_once('-') {
        Some((a, b)) if !a.trim().is_empty() => (
            a.trim().parse::<i64>().map_err(|_| invalid())?,
            b.trim().parse::<i64>().map_err(|_| invalid())?,
        ),
        _ => {
            let n = s.parse::<i64>().map_err(|_| invalid())?;
            (n, n)
        }
    };
    if lo > hi {
        return Err(invalid());
    }
    Ok((lo, hi))
}

fn now_stamp() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!(
            "[day]-[month]-[year]__[hour]:[minute]:[second]:[subsecond digits:6]"
        ))
        .unwrap_or_default()
}
