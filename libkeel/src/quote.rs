use crate::error::KeelResult;

#[inline]
fn needs_bs_quote(c: char) -> bool {
    c == '\'' || c == '!'
}

/// quotes `src` for the shell: the whole thing is wrapped in single quotes,
/// with any single quote or exclamation point stepping out of the quoting
///
///  name  ==> 'name'
///  a b   ==> 'a b'
///  a'b   ==> 'a'\''b'
///  a!b   ==> 'a'\!'b'
pub fn sq_quote(src: &str) -> String {
    let mut buf = String::with_capacity(src.len() + 2);
    buf.push('\'');
    for c in src.chars() {
        if needs_bs_quote(c) {
            buf.push('\'');
            buf.push('\\');
            buf.push(c);
            buf.push('\'');
        } else {
            buf.push(c);
        }
    }
    buf.push('\'');
    buf
}

/// inverse of [`sq_quote`]; fails on anything not produced by it
pub fn sq_dequote(arg: &str) -> KeelResult<String> {
    let mut out = String::with_capacity(arg.len());
    let mut chars = arg.chars();
    ensure!(chars.next() == Some('\''), "sq-quoted string must start with a quote");

    loop {
        let c = chars.next().ok_or_else(|| anyhow!("unterminated sq-quoted string"))?;
        if c != '\'' {
            out.push(c);
            continue;
        }
        // stepped out of the single quotes
        match chars.next() {
            None => return Ok(out),
            Some('\\') => {
                let c = chars.next().ok_or_else(|| anyhow!("bad sq escape"))?;
                ensure!(
                    needs_bs_quote(c) && chars.next() == Some('\''),
                    "bad sq escape in `{}`",
                    arg
                );
                out.push(c);
            }
            Some(c) => bail!("unexpected `{}` after closing quote", c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelResult;

    #[test]
    fn sq_quote_examples() {
        assert_eq!(sq_quote("name"), "'name'");
        assert_eq!(sq_quote("a b"), "'a b'");
        assert_eq!(sq_quote("a'b"), r#"'a'\''b'"#);
        assert_eq!(sq_quote("a!b"), r#"'a'\!'b'"#);
    }

    #[test]
    fn sq_quote_round_trips() -> KeelResult<()> {
        for s in ["name", "a b", "a'b", "a!b", "it's all! quite 'odd'", ""] {
            assert_eq!(sq_dequote(&sq_quote(s))?, s);
        }
        Ok(())
    }

    #[test]
    fn sq_dequote_rejects_garbage() {
        assert!(sq_dequote("name").is_err());
        assert!(sq_dequote("'unterminated").is_err());
        assert!(sq_dequote("'a'x").is_err());
    }
}
