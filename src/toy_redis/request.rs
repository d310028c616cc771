use super::error::ProtocolError;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String },
}

/// Parses one request line.
///
/// The line terminator (`\n` or `\r\n`) is optional. Tokens are separated by
/// single spaces, so doubled spaces yield empty tokens that count towards the
/// argument total.
pub fn parse_request(line: &str) -> Result<Command, ProtocolError> {
    let line = strip_terminator(line);
    let mut tokens = line.split(' ');
    // `split` always yields at least one item, possibly empty.
    let verb = tokens.next().unwrap_or_default();
    let args: Vec<&str> = tokens.collect();

    match verb {
        "GET" => {
            let [key] = expect_args::<1>("GET", &args)?;
            Ok(Command::Get {
                key: non_empty_key("GET", key)?,
            })
        }
        "SET" => {
            let [key, value] = expect_args::<2>("SET", &args)?;
            Ok(Command::Set {
                key: non_empty_key("SET", key)?,
                value: value.to_string(),
            })
        }
        other => Err(ProtocolError::UnknownVerb(other.to_string())),
    }
}

fn strip_terminator(line: &str) -> &str {
    match line.strip_suffix('\n') {
        Some(rest) => rest.strip_suffix('\r').unwrap_or(rest),
        None => line.trim_end_matches(LINE_ENDINGS),
    }
}

fn expect_args<'a, const N: usize>(
    verb: &'static str,
    args: &[&'a str],
) -> Result<[&'a str; N], ProtocolError> {
    <[&str; N]>::try_from(args).map_err(|_| ProtocolError::WrongArity {
        verb,
        expected: N,
        got: args.len(),
    })
}

fn non_empty_key(verb: &'static str, key: &str) -> Result<String, ProtocolError> {
    if key.is_empty() {
        Err(ProtocolError::MissingKey { verb })
    } else {
        Ok(key.to_string())
    }
}
