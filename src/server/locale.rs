// src/server/locale.rs
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Ru,
}

impl Locale {
    pub const ALL: &'static [Locale] = &[Locale::En, Locale::Ru];

    pub fn tag(self) -> &'static str {
        match self {
            Locale::En => "en",
            Locale::Ru => "ru",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|l| l.tag().eq_ignore_ascii_case(tag))
    }
}

/// Primary subtag of the first entry in an `Accept-Language` value,
/// e.g. `"ru-RU,ru;q=0.9,en"` -> `"ru"`.
pub fn first_language(header: &str) -> Option<&str> {
    let first = header.split(',').next()?;
    let range = first.split(';').next()?.trim();
    let primary = range.split(['-', '_']).next()?.trim();
    if primary.is_empty() || primary == "*" {
        None
    } else {
        Some(primary)
    }
}

pub fn negotiate(header: Option<&str>, supported: &[Locale], fallback: Locale) -> Locale {
    header
        .and_then(first_language)
        .and_then(Locale::from_tag)
        .filter(|l| supported.contains(l))
        .unwrap_or(fallback)
}

/// How a session picks the language of its page.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalePolicy {
    pub default: Locale,
    pub prefer_client: bool,
}

impl LocalePolicy {
    pub fn choose(&self, accept_language: Option<&str>) -> Locale {
        if !self.prefer_client {
            return self.default;
        }
        negotiate(accept_language, Locale::ALL, self.default)
    }
}
