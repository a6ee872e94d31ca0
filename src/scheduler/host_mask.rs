use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::weight::{weigh_string, Weigh};

/// Case-insensitive regular expression matched against a whole render host name.
///
/// An empty pattern matches nothing, so an empty include mask means "any host"
/// only through [`HostMasks::allows`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostMask {
    pattern: String,
    regex: Option<Regex>,
}

impl HostMask {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        if pattern.is_empty() {
            return Ok(Self::default());
        }
        let regex = RegexBuilder::new(&format!("^(?:{})$", pattern))
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex: Some(regex),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.regex.is_none()
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, host: &str) -> bool {
        self.regex.as_ref().is_some_and(|r| r.is_match(host))
    }
}

impl PartialEq for HostMask {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl TryFrom<String> for HostMask {
    type Error = regex::Error;

    fn try_from(pattern: String) -> Result<Self, Self::Error> {
        HostMask::new(&pattern)
    }
}

impl From<HostMask> for String {
    fn from(mask: HostMask) -> Self {
        mask.pattern
    }
}

/// Include and exclude masks, as carried by jobs and users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMasks {
    pub include: HostMask,
    pub exclude: HostMask,
}

impl HostMasks {
    pub fn new(include: &str, exclude: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            include: HostMask::new(include)?,
            exclude: HostMask::new(exclude)?,
        })
    }

    /// A host passes when the include mask is empty or matches, and the
    /// exclude mask does not match.
    pub fn allows(&self, host: &str) -> bool {
        (self.include.is_empty() || self.include.matches(host)) && !self.exclude.matches(host)
    }
}

impl Weigh for HostMasks {
    fn calc_weight(&self) -> usize {
        // Compiled automata are not accounted.
        weigh_string(&self.include.pattern) + weigh_string(&self.exclude.pattern)
    }
}
