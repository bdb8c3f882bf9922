//! Autorefresh configuration for [`RequestSubscription`](crate::RequestSubscription).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Deadline for the `online` policy when no threshold is configured.
pub const DEFAULT_AUTOREFRESH_THRESHOLD: Duration = Duration::from_millis(30_000);

/// A policy or mode string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what} `{value}`")]
pub struct ParseOptionError {
    what: &'static str,
    value: String,
}

/// Conditions under which a subscription reissues its request on its own.
///
/// Parsed from a comma separated list such as `"online,invalid"`; `true`
/// means `online,invalid` and `false` disables autorefresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AutorefreshPolicy {
    /// Reissue after the network or the surface was unavailable for longer
    /// than the threshold.
    pub online: bool,
    /// Reissue every threshold interval.
    pub interval: bool,
    /// Reissue when the request is invalidated.
    pub invalid: bool,
}

impl AutorefreshPolicy {
    /// No autorefresh.
    pub const NONE: Self = Self {
        online: false,
        interval: false,
        invalid: false,
    };

    /// The policy enabled by `autorefresh = true`.
    pub const DEFAULT_ENABLED: Self = Self {
        online: true,
        interval: false,
        invalid: true,
    };

    /// `true` when no condition is enabled.
    pub fn is_empty(&self) -> bool {
        !(self.online || self.interval || self.invalid)
    }
}

impl From<bool> for AutorefreshPolicy {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::DEFAULT_ENABLED
        } else {
            Self::NONE
        }
    }
}

impl FromStr for AutorefreshPolicy {
    type Err = ParseOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "true" => return Ok(Self::DEFAULT_ENABLED),
            "false" | "" => return Ok(Self::NONE),
            _ => {}
        }
        let mut policy = Self::NONE;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part {
                "online" => policy.online = true,
                "interval" => policy.interval = true,
                "invalid" => policy.invalid = true,
                other => {
                    return Err(ParseOptionError {
                        what: "autorefresh policy",
                        value: other.to_string(),
                    })
                }
            }
        }
        Ok(policy)
    }
}

impl fmt::Display for AutorefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = [
            (self.online, "online"),
            (self.interval, "interval"),
            (self.invalid, "invalid"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
        if parts.is_empty() {
            return f.write_str("false");
        }
        f.write_str(&parts.join(","))
    }
}

impl Serialize for AutorefreshPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AutorefreshPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            List(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Flag(enabled) => Ok(enabled.into()),
            Repr::List(list) => list.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// How a reissued request treats the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    /// Bypass the cache and block on the network.
    Reload,
    /// Serve from cache and revalidate in the background.
    Refresh,
    /// Let the requester's cache policy decide.
    Policy,
}

impl FromStr for RefreshMode {
    type Err = ParseOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "reload" => Ok(RefreshMode::Reload),
            "refresh" => Ok(RefreshMode::Refresh),
            "policy" => Ok(RefreshMode::Policy),
            other => Err(ParseOptionError {
                what: "refresh mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Autorefresh settings of a [`RequestSubscription`](crate::RequestSubscription).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionOptions {
    /// Enabled autorefresh conditions.
    pub autorefresh: AutorefreshPolicy,
    /// Threshold in milliseconds.
    ///
    /// Used as the polling period of the `interval` policy, which stays
    /// inactive without it, and as the unavailability deadline of the
    /// `online` policy, which falls back to
    /// [`DEFAULT_AUTOREFRESH_THRESHOLD`].
    pub autorefresh_threshold: Option<u64>,
    /// Mode of automatic reissues; [`RefreshMode::Policy`] when unset.
    pub autorefresh_behavior: Option<RefreshMode>,
}

impl SubscriptionOptions {
    /// Start building options.
    pub fn builder() -> SubscriptionOptionsBuilder {
        SubscriptionOptionsBuilder::new()
    }

    /// Polling period, if the `interval` policy can run.
    pub fn interval(&self) -> Option<Duration> {
        self.autorefresh_threshold
            .filter(|ms| *ms > 0 && self.autorefresh.interval)
            .map(Duration::from_millis)
    }

    /// How long the network may be unavailable before the `online` policy
    /// reissues.
    pub fn online_deadline(&self) -> Duration {
        self.autorefresh_threshold
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_AUTOREFRESH_THRESHOLD)
    }
}

/// Builder for [`SubscriptionOptions`].
///
/// # Example
///
/// ```
/// use request_flow::{AutorefreshPolicy, RefreshMode, SubscriptionOptions};
/// use std::time::Duration;
///
/// let options = SubscriptionOptions::builder()
///     .autorefresh("online,interval".parse::<AutorefreshPolicy>().unwrap())
///     .autorefresh_threshold(Duration::from_secs(5))
///     .autorefresh_behavior(RefreshMode::Refresh)
///     .build();
/// assert_eq!(options.interval(), Some(Duration::from_secs(5)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptionsBuilder {
    options: SubscriptionOptions,
}

impl SubscriptionOptionsBuilder {
    /// Builder with autorefresh disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the enabled autorefresh conditions.
    pub fn autorefresh(mut self, policy: impl Into<AutorefreshPolicy>) -> Self {
        self.options.autorefresh = policy.into();
        self
    }

    /// Set the threshold.
    pub fn autorefresh_threshold(mut self, threshold: Duration) -> Self {
        let millis = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        self.options.autorefresh_threshold = Some(millis);
        self
    }

    /// Set the mode of automatic reissues.
    pub fn autorefresh_behavior(mut self, mode: RefreshMode) -> Self {
        self.options.autorefresh_behavior = Some(mode);
        self
    }

    /// Finish.
    pub fn build(self) -> SubscriptionOptions {
        self.options
    }
}
