use crate::http::limits::HttpLimits;
use crate::http::types::{HttpError, Status};
use indexmap::IndexMap;

/// Decoded query string: insertion-ordered, first value wins on duplicate
/// keys.
pub type QueryMap = IndexMap<String, String>;

#[inline]
fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes `%HH` escapes; `+` becomes a space when asked for (query
/// components only, never paths).
pub(crate) fn percent_decode(raw: &[u8], plus_as_space: bool) -> Result<String, HttpError> {
    let mut decoded = Vec::with_capacity(raw.len());
    let mut cursor = 0;

    while cursor < raw.len() {
        match raw[cursor] {
            b'%' => {
                let high = raw
                    .get(cursor + 1)
                    .copied()
                    .and_then(hex_value)
                    .ok_or_else(|| HttpError::new(Status::BAD_REQUEST, "bad escape"))?;
                let low = raw
                    .get(cursor + 2)
                    .copied()
                    .and_then(hex_value)
                    .ok_or_else(|| HttpError::new(Status::BAD_REQUEST, "bad escape"))?;

                decoded.push(high << 4 | low);
                cursor += 3;
            }
            b'+' if plus_as_space => {
                decoded.push(b' ');
                cursor += 1;
            }
            byte => {
                decoded.push(byte);
                cursor += 1;
            }
        }
    }

    String::from_utf8(decoded)
        .map_err(|_| HttpError::new(Status::BAD_REQUEST, "escape is not utf-8"))
}

/// Parses the portion after `?`. Key and value sizes are checked on the raw
/// encoded text; a pair beyond the configured count rejects the request.
pub fn parse(raw: &[u8], limits: &HttpLimits) -> Result<QueryMap, HttpError> {
    let mut query = QueryMap::new();

    if raw.is_empty() {
        return Ok(query);
    }

    let mut pairs = 0;

    for pair in raw.split(|&byte| byte == b'&') {
        if pair.is_empty() {
            continue;
        }

        if pairs == limits.max_query_params {
            return Err(HttpError::new(
                Status::BAD_REQUEST,
                "too many query parameters",
            ));
        }

        pairs += 1;

        let (key_raw, value_raw) = match pair.iter().position(|&byte| byte == b'=') {
            Some(eq) => (&pair[..eq], &pair[eq + 1..]),
            None => (pair, &pair[pair.len()..]),
        };

        if key_raw.len() > limits.max_query_key {
            return Err(HttpError::new(Status::URI_TOO_LONG, "query key too long"));
        }

        if value_raw.len() > limits.max_query_value {
            return Err(HttpError::new(Status::URI_TOO_LONG, "query value too long"));
        }

        let key = percent_decode(key_raw, true)?;
        let value = percent_decode(value_raw, true)?;

        query.entry(key).or_insert(value);
    }

    Ok(query)
}
