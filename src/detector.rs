//! Suspicious-token scanning over named request fields.

use std::borrow::Cow;

/// Tokens that mark an input value as suspicious.
///
/// The default set covers quote characters and the statement separator, SQL comment
/// markers (`--`, `/*`, `*/`), and shell chaining (`&&`, `|`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspiciousPatterns {
    tokens: Vec<Cow<'static, str>>,
}

/// Built-in token set.
pub const DEFAULT_TOKENS: &[&str] = &["'", "\"", ";", "--", "/*", "*/", "&&", "|"];

impl Default for SuspiciousPatterns {
    fn default() -> Self {
        Self { tokens: DEFAULT_TOKENS.iter().map(|t| Cow::Borrowed(*t)).collect() }
    }
}

impl SuspiciousPatterns {
    /// Custom token set. Empty tokens are dropped, since they would match everything.
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Cow<'static, str>>,
    {
        Self { tokens: tokens.into_iter().map(Into::into).filter(|t| !t.is_empty()).collect() }
    }

    /// Add a token to the set.
    pub fn with_token(mut self, token: impl Into<Cow<'static, str>>) -> Self {
        let token = token.into();
        if !token.is_empty() && !self.tokens.contains(&token) {
            self.tokens.push(token);
        }
        self
    }

    /// The configured tokens, in match priority order.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(|t| t.as_ref())
    }

    /// First token found in `value`, if any.
    pub fn find(&self, value: &str) -> Option<&str> {
        if value.is_empty() {
            return None;
        }
        self.tokens.iter().map(|t| t.as_ref()).find(|t| value.contains(t))
    }
}

/// The first suspicious field reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMatch<'a> {
    /// Field name as supplied by the caller.
    pub field: &'a str,
    /// The offending value.
    pub value: &'a str,
    /// Token that matched.
    pub token: String,
}

/// Pattern matcher over an ordered list of `(name, value)` fields.
#[derive(Debug, Clone, Default)]
pub struct AbuseSignalDetector {
    patterns: SuspiciousPatterns,
}

impl AbuseSignalDetector {
    /// Detector over a specific token set.
    pub fn new(patterns: SuspiciousPatterns) -> Self {
        Self { patterns }
    }

    /// Active patterns.
    pub fn patterns(&self) -> &SuspiciousPatterns {
        &self.patterns
    }

    /// Scan fields in the order given and report the first one containing a token.
    ///
    /// Empty values never match; an absent field is simply left out.
    ///
    /// ```
    /// use tripwire::AbuseSignalDetector;
    ///
    /// let detector = AbuseSignalDetector::default();
    /// let hit = detector
    ///     .scan([("host", "127.0.0.1"), ("ua", "curl/8.0 | sh")])
    ///     .expect("pipe is suspicious");
    /// assert_eq!(hit.field, "ua");
    /// ```
    pub fn scan<'a, I>(&self, fields: I) -> Option<SignalMatch<'a>>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        fields.into_iter().find_map(|(field, value)| {
            self.patterns.find(value).map(|token| SignalMatch {
                field,
                value,
                token: token.to_owned(),
            })
        })
    }
}
