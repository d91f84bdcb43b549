// Chain selection: three hops, entry/middle/exit
//
// A hop is either a concrete remailer name or `*`. Concrete names must sit in
// the pool for their position; wildcards are resolved here, at submission
// time, so the relay client never sees a `*`.

use crate::registry::RemailerPool;
use rand::seq::SliceRandom;
use std::fmt;
use thiserror::Error;

pub const WILDCARD: &str = "*";
pub const HOP_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Entry,
    Middle,
    Exit,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Entry => write!(f, "entry"),
            Position::Middle => write!(f, "middle"),
            Position::Exit => write!(f, "exit"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Chain contains characters outside [a-zA-Z0-9,*-]")]
    Syntax,
    #[error("Chain must have exactly 3 hops, got {0}")]
    HopCount(usize),
    #[error("Empty {0} hop")]
    EmptyHop(Position),
    #[error("Remailer {name} is not eligible as {position} hop")]
    WrongPosition { name: String, position: Position },
    #[error("Unknown remailer {0}")]
    UnknownRemailer(String),
    #[error("No eligible candidates for {0} hop")]
    NoCandidates(Position),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hop {
    Named(String),
    Random,
}

impl Hop {
    fn parse(raw: &str, position: Position) -> Result<Self, ChainError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ChainError::EmptyHop(position));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '*')
        {
            return Err(ChainError::Syntax);
        }
        if raw == WILDCARD {
            Ok(Hop::Random)
        } else if raw.contains('*') {
            Err(ChainError::Syntax)
        } else {
            Ok(Hop::Named(raw.to_ascii_lowercase()))
        }
    }

    pub fn is_random(&self) -> bool {
        matches!(self, Hop::Random)
    }
}

/// A requested chain, before wildcard resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    hops: [Hop; HOP_COUNT],
}

impl ChainSpec {
    /// Parse `"entry,middle,exit"`
    pub fn parse(chain: &str) -> Result<Self, ChainError> {
        if chain.is_empty()
            || !chain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ',' | '*' | '-'))
        {
            return Err(ChainError::Syntax);
        }
        let parts: Vec<&str> = chain.split(',').collect();
        if parts.len() != HOP_COUNT {
            return Err(ChainError::HopCount(parts.len()));
        }
        Self::from_hops(parts[0], parts[1], parts[2])
    }

    pub fn from_hops(entry: &str, middle: &str, exit: &str) -> Result<Self, ChainError> {
        Ok(Self {
            hops: [
                Hop::parse(entry, Position::Entry)?,
                Hop::parse(middle, Position::Middle)?,
                Hop::parse(exit, Position::Exit)?,
            ],
        })
    }

    pub fn hops(&self) -> &[Hop; HOP_COUNT] {
        &self.hops
    }

    /// `named`/`random` per position; carries no remailer names
    pub fn shape(&self) -> String {
        self.hops
            .iter()
            .map(|h| if h.is_random() { "random" } else { "named" })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Check named hops against `pool` and draw every wildcard from its
    /// position's pool. Wildcards avoid names already in the chain when the
    /// pool has room.
    pub fn resolve(&self, pool: &RemailerPool) -> Result<ResolvedChain, ChainError> {
        let positions = [Position::Entry, Position::Middle, Position::Exit];
        let mut resolved: [Option<String>; HOP_COUNT] = Default::default();

        for (i, (hop, position)) in self.hops.iter().zip(positions).enumerate() {
            if let Hop::Named(name) = hop {
                check_position(pool, name, position)?;
                resolved[i] = Some(name.clone());
            }
        }

        let mut rng = rand::thread_rng();
        for (i, position) in positions.into_iter().enumerate() {
            if resolved[i].is_some() {
                continue;
            }
            let candidates = candidates_for(pool, position);
            if candidates.is_empty() {
                return Err(ChainError::NoCandidates(position));
            }
            let unused: Vec<&str> = candidates
                .iter()
                .copied()
                .filter(|c| !resolved.iter().flatten().any(|r| r.as_str() == *c))
                .collect();
            let choice = unused
                .choose(&mut rng)
                .or_else(|| candidates.choose(&mut rng))
                .ok_or(ChainError::NoCandidates(position))?;
            resolved[i] = Some((*choice).to_string());
        }

        let [entry, middle, exit] = resolved;
        match (entry, middle, exit) {
            (Some(entry), Some(middle), Some(exit)) => Ok(ResolvedChain {
                hops: [entry, middle, exit],
            }),
            _ => Err(ChainError::NoCandidates(Position::Entry)),
        }
    }
}

fn candidates_for(pool: &RemailerPool, position: Position) -> Vec<&str> {
    match position {
        Position::Middle => pool.middle_names(),
        Position::Entry | Position::Exit => pool.entry_exit_names(),
    }
}

fn check_position(pool: &RemailerPool, name: &str, position: Position) -> Result<(), ChainError> {
    let eligible = match position {
        Position::Middle => pool.is_middle(name),
        Position::Entry | Position::Exit => pool.is_entry_exit(name),
    };
    if eligible {
        Ok(())
    } else if pool.contains(name) {
        Err(ChainError::WrongPosition {
            name: name.to_string(),
            position,
        })
    } else {
        Err(ChainError::UnknownRemailer(name.to_string()))
    }
}

/// Three concrete remailer names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChain {
    hops: [String; HOP_COUNT],
}

impl ResolvedChain {
    pub fn entry(&self) -> &str {
        &self.hops[0]
    }

    pub fn middle(&self) -> &str {
        &self.hops[1]
    }

    pub fn exit(&self) -> &str {
        &self.hops[2]
    }

    /// Comma-joined form handed to the relay client
    pub fn to_arg(&self) -> String {
        self.hops.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RemailerEntry;

    fn pool() -> RemailerPool {
        let lines = [
            "alpha 000 :10 +++ 99.0%",
            "bravo 000 :12 +++ 98.0%",
            "charlie 000 :20 +++ 97.0%",
            "delta 000 :05 +++ 99.5% D",
            "echo 000 :07 +++ 99.1% D",
        ];
        RemailerPool::from_entries(lines.iter().filter_map(|l| RemailerEntry::parse_line(l)))
    }

    #[test]
    fn test_parse_rejects_bad_syntax() {
        assert_eq!(ChainSpec::parse("alpha;delta,bravo"), Err(ChainError::Syntax));
        assert_eq!(ChainSpec::parse("alpha delta bravo"), Err(ChainError::Syntax));
        assert_eq!(ChainSpec::parse(""), Err(ChainError::Syntax));
        assert_eq!(ChainSpec::parse("alpha,delta"), Err(ChainError::HopCount(2)));
        assert_eq!(ChainSpec::parse("a,b,c,d"), Err(ChainError::HopCount(4)));
        assert_eq!(ChainSpec::parse("al*ha,*,*"), Err(ChainError::Syntax));
        assert_eq!(
            ChainSpec::parse("alpha,,bravo"),
            Err(ChainError::EmptyHop(Position::Middle))
        );
    }

    #[test]
    fn test_named_chain_resolves_as_is() {
        let spec = ChainSpec::parse("Alpha,delta,bravo").unwrap();
        assert_eq!(spec.shape(), "named/named/named");
        let chain = spec.resolve(&pool()).unwrap();
        assert_eq!(chain.to_arg(), "alpha,delta,bravo");
    }

    #[test]
    fn test_wildcards_respect_partition() {
        let spec = ChainSpec::parse("*,*,*").unwrap();
        assert_eq!(spec.shape(), "random/random/random");
        let pool = pool();
        for _ in 0..50 {
            let chain = spec.resolve(&pool).unwrap();
            assert!(pool.is_entry_exit(chain.entry()));
            assert!(pool.is_middle(chain.middle()));
            assert!(pool.is_entry_exit(chain.exit()));
            assert_ne!(chain.entry(), chain.exit());
            assert!(!chain.to_arg().contains('*'));
        }
    }

    #[test]
    fn test_wildcard_avoids_named_hop() {
        let spec = ChainSpec::from_hops("alpha", "*", "*").unwrap();
        let pool = pool();
        for _ in 0..30 {
            let chain = spec.resolve(&pool).unwrap();
            assert_eq!(chain.entry(), "alpha");
            assert_ne!(chain.exit(), "alpha");
        }
    }

    #[test]
    fn test_wrong_position_and_unknown() {
        let pool = pool();
        assert_eq!(
            ChainSpec::parse("delta,echo,alpha").unwrap().resolve(&pool),
            Err(ChainError::WrongPosition {
                name: "delta".into(),
                position: Position::Entry
            })
        );
        assert_eq!(
            ChainSpec::parse("alpha,bravo,charlie").unwrap().resolve(&pool),
            Err(ChainError::WrongPosition {
                name: "bravo".into(),
                position: Position::Middle
            })
        );
        assert_eq!(
            ChainSpec::parse("alpha,delta,zulu").unwrap().resolve(&pool),
            Err(ChainError::UnknownRemailer("zulu".into()))
        );
    }

    #[test]
    fn test_empty_pool_has_no_candidates() {
        let spec = ChainSpec::parse("*,*,*").unwrap();
        assert_eq!(
            spec.resolve(&RemailerPool::default()),
            Err(ChainError::NoCandidates(Position::Entry))
        );
    }

    #[test]
    fn test_single_entry_exit_candidate_is_reused() {
        let pool = RemailerPool::from_entries(
            ["solo 000 :10 +++ 99.0%", "mid 000 :10 +++ 99.0% D"]
                .iter()
                .filter_map(|l| RemailerEntry::parse_line(l)),
        );
        let chain = ChainSpec::parse("*,*,*").unwrap().resolve(&pool).unwrap();
        assert_eq!(chain.to_arg(), "solo,mid,solo");
    }
}
