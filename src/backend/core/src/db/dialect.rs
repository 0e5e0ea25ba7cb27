//! SQL text differences between the supported backends.
//!
//! Queries are written once with `?` placeholders and rewritten here for
//! backends that number their parameters.

use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    /// Rewrite `?` placeholders into this dialect's form.
    ///
    /// Question marks inside single-quoted literals are left alone.
    pub fn sql(self, query: &str) -> Cow<'_, str> {
        if self != Dialect::Postgres {
            return Cow::Borrowed(query);
        }

        let mut out = String::with_capacity(query.len() + 8);
        let mut n = 0;
        let mut in_literal = false;
        for c in query.chars() {
            match c {
                '\'' => {
                    in_literal = !in_literal;
                    out.push(c);
                }
                '?' if !in_literal => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(c),
            }
        }
        Cow::Owned(out)
    }

    /// Quote an identifier that collides with a reserved word.
    pub fn quote(self, ident: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", ident),
            Dialect::Sqlite | Dialect::Postgres => format!("\"{}\"", ident),
        }
    }
}
