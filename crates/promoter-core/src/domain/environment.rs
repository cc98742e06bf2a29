//! Ordered deployment environments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::PromoterError;

/// A deployment environment. Environments form the chain dev → stage → prod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Stage,
    Prod,
}

impl Environment {
    /// All environments in promotion order.
    pub const ALL: [Environment; 3] = [Environment::Dev, Environment::Stage, Environment::Prod];

    /// The only valid promotion target from this environment.
    pub fn downstream(self) -> Option<Environment> {
        match self {
            Environment::Dev => Some(Environment::Stage),
            Environment::Stage => Some(Environment::Prod),
            Environment::Prod => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Stage => "stage",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = PromoterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "stage" | "staging" => Ok(Environment::Stage),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(PromoterError::InvalidEnvironment(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_has_no_cycles() {
        for env in Environment::ALL {
            let mut seen = vec![env];
            let mut cur = env;
            while let Some(next) = cur.downstream() {
                assert!(!seen.contains(&next));
                assert!(next > cur);
                seen.push(next);
                cur = next;
            }
        }
        assert_eq!(Environment::Prod.downstream(), None);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Stage);
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Prod);
        let err = "qa".parse::<Environment>().unwrap_err();
        assert!(err.to_string().contains("qa"));
    }
}
