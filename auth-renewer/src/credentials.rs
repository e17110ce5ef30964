use std::collections::BTreeMap;

/// An opaque identifier set for an application: a user-key, an app-id/app-key
/// pair, or an OAuth token, depending on what the caller populated `creds`
/// with. The renewer never interprets the field names itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Credentials {
    creds: BTreeMap<String, String>,
    oauth: bool,
}

impl Credentials {
    pub fn new(creds: BTreeMap<String, String>, oauth: bool) -> Self {
        Self { creds, oauth }
    }

    pub fn creds(&self) -> &BTreeMap<String, String> {
        &self.creds
    }

    pub fn is_oauth(&self) -> bool {
        self.oauth
    }

    /// Canonical string form used in KV keys and channel names: fields sorted
    /// lexicographically by key (guaranteed by the `BTreeMap`), `key:value`
    /// pairs joined by `,`, with `:` and `,` inside values percent-escaped so
    /// the surrounding grammar (`service_id:<s>,<creds>,metric:<m>`) stays
    /// unambiguous.
    pub fn to_sorted_escaped_s(&self) -> String {
        self.creds
            .iter()
            .map(|(key, value)| format!("{}:{}", escape(key), escape(value)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Percent-escape only the delimiter characters the grammar relies on. Using
/// a narrow escape set (rather than full percent-encoding) keeps canonical
/// strings readable in logs while still round-tripping uniquely.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            ':' => out.push_str("%3A"),
            ',' => out.push_str("%2C"),
            '%' => out.push_str("%25"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`escape`]. Used when parsing a canonical credentials string
/// back out of a channel or request payload.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '%' {
            let rest: String = chars.by_ref().take(2).collect();
            match rest.as_str() {
                "3A" => out.push(':'),
                "2C" => out.push(','),
                "25" => out.push('%'),
                _ => {
                    out.push('%');
                    out.push_str(&rest);
                }
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(pairs: &[(&str, &str)]) -> Credentials {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Credentials::new(map, false)
    }

    #[test]
    fn canonical_form_sorts_keys() {
        let c = creds(&[("user_key", "abc"), ("app_id", "xyz")]);
        assert_eq!(c.to_sorted_escaped_s(), "app_id:xyz,user_key:abc");
    }

    #[test]
    fn canonical_form_escapes_delimiters() {
        let c = creds(&[("user_key", "a:b,c%d")]);
        assert_eq!(c.to_sorted_escaped_s(), "user_key:a%3Ab%2Cc%25d");
    }

    #[test]
    fn escape_unescape_round_trips() {
        let raw = "weird:value,with%percent";
        assert_eq!(unescape(&escape(raw)), raw);
    }

    #[test]
    fn oauth_flag_is_preserved() {
        let c = Credentials::new(BTreeMap::new(), true);
        assert!(c.is_oauth());
    }
}
