//! Light rewriting of caller-supplied SQL tails (`WHERE ... GROUP BY ... ORDER BY ... LIMIT ...`).
//!
//! The fragment is not parsed into an AST. It is split at clause keywords that
//! appear at the top level, outside quotes and parentheses, so that predicates
//! can be ANDed onto the WHERE body and the LIMIT replaced.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
    Lock,
}

const KEYWORDS: [(&[&str], Clause); 7] = [
    (&["WHERE"], Clause::Where),
    (&["GROUP", "BY"], Clause::GroupBy),
    (&["HAVING"], Clause::Having),
    (&["ORDER", "BY"], Clause::OrderBy),
    (&["LIMIT"], Clause::Limit),
    (&["FOR", "UPDATE"], Clause::Lock),
    (&["LOCK", "IN"], Clause::Lock),
];

/// A post-SQL fragment split into its clauses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct PostSql {
    /// Text before the first clause keyword.
    pub head: String,
    pub where_body: Option<String>,
    pub group_by: Option<String>,
    pub having: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<String>,
    /// Locking suffix such as `FOR UPDATE`, kept verbatim.
    pub lock: Option<String>,
}

impl PostSql {
    /// Split `sql` at its top-level clause keywords.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] when a clause appears twice at the top level.
    pub fn parse(sql: &str) -> Result<Self> {
        let marks = scan(sql);
        let head_end = marks.first().map_or(sql.len(), |m| m.0);
        let mut post = Self {
            head: sql[..head_end].trim().to_string(),
            ..Self::default()
        };

        for (n, &(start, body_start, clause)) in marks.iter().enumerate() {
            let end = marks.get(n + 1).map_or(sql.len(), |m| m.0);
            let body = if clause == Clause::Lock { &sql[start..end] } else { &sql[body_start..end] };
            let body = body.trim().trim_end_matches(';').trim_end();

            let slot = match clause {
                Clause::Where => &mut post.where_body,
                Clause::GroupBy => &mut post.group_by,
                Clause::Having => &mut post.having,
                Clause::OrderBy => &mut post.order_by,
                Clause::Limit => &mut post.limit,
                Clause::Lock => &mut post.lock,
            };
            if slot.is_some() {
                return Err(Error::invalid(format!("duplicate {clause:?} clause in `{sql}`")));
            }
            if !body.is_empty() {
                *slot = Some(body.to_string());
            }
        }

        Ok(post)
    }

    /// Whether the fragment carries no text at all.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.to_string().trim().is_empty()
    }

    /// AND `predicate` onto the WHERE body, parenthesizing the existing body so
    /// a top-level `OR` cannot escape it.
    pub fn and_where(&mut self, predicate: &str) {
        self.where_body = Some(match self.where_body.take() {
            Some(body) => format!("({body}) AND {predicate}"),
            None => predicate.to_string(),
        });
    }

    /// Replace any caller LIMIT with a page window and make the order deterministic.
    ///
    /// `keys` are the qualified key columns used for ordering when the fragment
    /// has neither ORDER BY nor GROUP BY and `auto_order` is set.
    pub fn paginate(&mut self, limit: String, keys: &[String], auto_order: bool) {
        if let Some(stripped) = self.limit.replace(limit) {
            tracing::debug!(limit = %stripped, "caller LIMIT replaced by page window");
        }

        if self.order_by.is_none() && self.group_by.is_none() && auto_order && !keys.is_empty() {
            self.order_by = Some(keys.join(", "));
        }

        if !self.group_by_covered() {
            tracing::warn!(
                group_by = self.group_by.as_deref().unwrap_or_default(),
                order_by = self.order_by.as_deref().unwrap_or_default(),
                "ORDER BY does not cover every GROUP BY column, page order may be unstable"
            );
        }
    }

    /// Whether every GROUP BY column also appears in ORDER BY.
    #[must_use]
    pub fn group_by_covered(&self) -> bool {
        let Some(group_by) = &self.group_by else {
            return true;
        };
        let ordered: Vec<String> = self
            .order_by
            .as_deref()
            .map(split_top_level)
            .unwrap_or_default()
            .into_iter()
            .map(|term| normalize(strip_direction(term)))
            .collect();

        split_top_level(group_by).into_iter().all(|column| ordered.contains(&normalize(column)))
    }
}

impl fmt::Display for PostSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.head.is_empty() {
            parts.push(self.head.clone());
        }
        let clauses = [
            ("WHERE", &self.where_body),
            ("GROUP BY", &self.group_by),
            ("HAVING", &self.having),
            ("ORDER BY", &self.order_by),
            ("LIMIT", &self.limit),
        ];
        for (keyword, body) in clauses {
            if let Some(body) = body {
                parts.push(format!("{keyword} {body}"));
            }
        }
        if let Some(lock) = &self.lock {
            parts.push(lock.clone());
        }
        f.write_str(&parts.join(" "))
    }
}

// (keyword start, body start, clause) for each top-level keyword
fn scan(sql: &str) -> Vec<(usize, usize, Clause)> {
    let bytes = sql.as_bytes();
    let mut marks = Vec::new();
    let mut depth = 0_i32;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            b'\'' | b'"' | b'`' => quote = Some(c),
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0 && c.is_ascii_alphabetic() && (i == 0 || !is_ident(bytes[i - 1])) => {
                if let Some((clause, end)) = keyword_at(bytes, i) {
                    marks.push((i, end, clause));
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }

    marks
}

fn keyword_at(bytes: &[u8], start: usize) -> Option<(Clause, usize)> {
    KEYWORDS.iter().find_map(|(words, clause)| match_words(bytes, start, words).map(|end| (*clause, end)))
}

fn match_words(bytes: &[u8], mut i: usize, words: &[&str]) -> Option<usize> {
    for (n, word) in words.iter().enumerate() {
        if n > 0 {
            let gap = i;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i == gap {
                return None;
            }
        }
        let word = word.as_bytes();
        let candidate = bytes.get(i..i + word.len())?;
        if !candidate.eq_ignore_ascii_case(word) {
            return None;
        }
        i += word.len();
        if bytes.get(i).is_some_and(|&c| is_ident(c)) {
            return None;
        }
    }
    Some(i)
}

const fn is_ident(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_i32;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in list.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(list[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(list[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

fn strip_direction(term: &str) -> &str {
    let term = term.trim();
    for suffix in [" asc", " desc"] {
        if term.len() > suffix.len() {
            let (head, tail) = term.split_at(term.len() - suffix.len());
            if tail.eq_ignore_ascii_case(suffix) {
                return head.trim_end();
            }
        }
    }
    term
}

fn normalize(column: &str) -> String {
    column.chars().filter(|c| !matches!(c, '`' | '"') && !c.is_whitespace()).collect::<String>().to_lowercase()
}
