//! Weighted selection of object sizes from configured size classes.
//!
//! Each size class names a byte range `[low, high)` and an integer weight. The [`SizeTable`]
//! expands the weights into a flat index in which every class appears `weight` times, so a
//! weighted draw is a single uniform pick from that index.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SizeClassConfig;
use crate::error::{Error, Result};

/// Label returned by [`SizeTable::classify`] for lengths outside every size class.
pub const UNCLASSIFIED: &str = "LARGE";

/// Largest supported sum of all size class weights.
pub const MAX_TOTAL_WEIGHT: u64 = 1 << 16;

/// How a concrete size is derived from the selected size class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingPolicy {
    /// A uniformly random size in `[low, high)`.
    #[default]
    Random,
    /// Always the lower bound of the class.
    LowBound,
}

impl FromStr for SizingPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(Self::Random),
            "low_bound" => Ok(Self::LowBound),
            other => Err(Error::UnknownSizingPolicy(other.to_owned())),
        }
    }
}

impl fmt::Display for SizingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Random => "random",
            Self::LowBound => "low_bound",
        })
    }
}

/// A validated size class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeClass {
    /// The configured name, used as a label for metrics.
    pub name: String,
    /// Inclusive lower bound in bytes.
    pub low: u64,
    /// Exclusive upper bound in bytes.
    pub high: u64,
    /// Relative selection weight. Classes with weight 0 are never drawn.
    pub weight: u32,
}

impl SizeClass {
    /// Returns `true` if `len` falls into `[low, high)`.
    pub fn contains(&self, len: u64) -> bool {
        self.low <= len && len < self.high
    }
}

/// The result of a single [`SizeTable::draw`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeDraw<'a> {
    /// The name of the selected size class.
    pub class: &'a str,
    /// The payload size in bytes.
    pub size: u64,
}

/// Immutable table of size classes with a derived weighted index.
#[derive(Clone, Debug)]
pub struct SizeTable {
    classes: Vec<SizeClass>,
    /// Indexes into `classes`, each repeated by the class weight.
    weighted_index: Vec<usize>,
    policy: SizingPolicy,
}

impl SizeTable {
    /// Builds the table, rejecting classes that could not be drawn from safely.
    pub fn new(config: &BTreeMap<String, SizeClassConfig>, policy: SizingPolicy) -> Result<Self> {
        let total: u64 = config.values().map(|class| u64::from(class.weight)).sum();
        if total > MAX_TOTAL_WEIGHT {
            return Err(Error::TotalWeightTooLarge {
                total,
                max: MAX_TOTAL_WEIGHT,
            });
        }

        let mut classes = Vec::with_capacity(config.len());
        let mut weighted_index = Vec::with_capacity(total as usize);

        for (name, class) in config {
            let low = class.low.as_u64();
            let high = class.high.as_u64();

            if low > high {
                return Err(Error::InvertedSizeRange {
                    class: name.clone(),
                    low,
                    high,
                });
            }
            if class.weight > 0 && policy == SizingPolicy::Random && low == high {
                return Err(Error::EmptySizeRange {
                    class: name.clone(),
                    low,
                    high,
                });
            }

            let idx = classes.len();
            weighted_index.extend(std::iter::repeat_n(idx, class.weight as usize));
            classes.push(SizeClass {
                name: name.clone(),
                low,
                high,
                weight: class.weight,
            });
        }

        if weighted_index.is_empty() {
            return Err(Error::NoWeightedSizeClass);
        }

        Ok(Self {
            classes,
            weighted_index,
            policy,
        })
    }

    /// All configured classes in name order, including those with weight 0.
    pub fn classes(&self) -> &[SizeClass] {
        &self.classes
    }

    /// The sum of all class weights.
    pub fn total_weight(&self) -> usize {
        self.weighted_index.len()
    }

    /// The sizing policy applied by [`draw`](Self::draw).
    pub fn policy(&self) -> SizingPolicy {
        self.policy
    }

    /// Draws a size class by weight, then a size from it according to the policy.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> SizeDraw<'_> {
        let slot = self.weighted_index[rng.random_range(0..self.weighted_index.len())];
        let class = &self.classes[slot];

        let size = match self.policy {
            SizingPolicy::Random => rng.random_range(class.low..class.high),
            SizingPolicy::LowBound => class.low,
        };

        SizeDraw {
            class: &class.name,
            size,
        }
    }

    /// Returns the name of the first class containing `len`, or [`UNCLASSIFIED`].
    pub fn classify(&self, len: u64) -> &str {
        self.classes
            .iter()
            .find(|class| class.contains(len))
            .map_or(UNCLASSIFIED, |class| &class.name)
    }
}

#[cfg(test)]
mod tests {
    use bytesize::ByteSize;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    use super::*;

    fn classes(entries: &[(&str, u64, u64, u32)]) -> BTreeMap<String, SizeClassConfig> {
        entries
            .iter()
            .map(|&(name, low, high, weight)| {
                let class = SizeClassConfig {
                    low: ByteSize::b(low),
                    high: ByteSize::b(high),
                    weight,
                };
                (name.to_owned(), class)
            })
            .collect()
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("random".parse::<SizingPolicy>().unwrap(), SizingPolicy::Random);
        assert_eq!(
            "low_bound".parse::<SizingPolicy>().unwrap(),
            SizingPolicy::LowBound
        );
        assert!(matches!(
            "gaussian".parse::<SizingPolicy>(),
            Err(Error::UnknownSizingPolicy(name)) if name == "gaussian"
        ));
    }

    #[test]
    fn draws_converge_to_weights() {
        let table = SizeTable::new(
            &classes(&[("small", 0, 1024, 1), ("medium", 1024, 4096, 3)]),
            SizingPolicy::Random,
        )
        .unwrap();
        let mut rng = SmallRng::seed_from_u64(1234);

        let draws = 100_000;
        let small = (0..draws)
            .filter(|_| table.draw(&mut rng).class == "small")
            .count();

        let share = small as f64 / draws as f64;
        assert!((share - 0.25).abs() < 0.01, "small share was {share}");
    }

    #[test]
    fn random_policy_stays_in_range() {
        let table = SizeTable::new(
            &classes(&[("a", 100, 110, 1), ("b", 5000, 5001, 1)]),
            SizingPolicy::Random,
        )
        .unwrap();
        let mut rng = SmallRng::seed_from_u64(7);

        for _ in 0..10_000 {
            let draw = table.draw(&mut rng);
            match draw.class {
                "a" => assert!((100..110).contains(&draw.size)),
                "b" => assert_eq!(draw.size, 5000),
                other => panic!("unexpected class {other}"),
            }
        }
    }

    #[test]
    fn low_bound_policy_returns_low() {
        let table = SizeTable::new(
            &classes(&[("a", 100, 200, 2), ("b", 7, 7, 1)]),
            SizingPolicy::LowBound,
        )
        .unwrap();
        let mut rng = SmallRng::seed_from_u64(7);

        for _ in 0..1000 {
            let draw = table.draw(&mut rng);
            let expected = if draw.class == "a" { 100 } else { 7 };
            assert_eq!(draw.size, expected);
        }
    }

    #[test]
    fn zero_weight_classes_are_never_drawn() {
        let table = SizeTable::new(
            &classes(&[("never", 0, 10, 0), ("always", 10, 20, 5)]),
            SizingPolicy::Random,
        )
        .unwrap();
        assert_eq!(table.total_weight(), 5);
        assert_eq!(table.classes().len(), 2);

        let mut rng = SmallRng::seed_from_u64(99);
        assert!((0..1000).all(|_| table.draw(&mut rng).class == "always"));
    }

    #[test]
    fn rejects_degenerate_random_range() {
        let err = SizeTable::new(&classes(&[("flat", 64, 64, 1)]), SizingPolicy::Random)
            .unwrap_err();
        assert!(matches!(err, Error::EmptySizeRange { class, .. } if class == "flat"));
    }

    #[test]
    fn rejects_inverted_range() {
        let err = SizeTable::new(&classes(&[("upside", 10, 5, 1)]), SizingPolicy::LowBound)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvertedSizeRange { low: 10, high: 5, .. }
        ));
    }

    #[test]
    fn requires_a_weighted_class() {
        let err = SizeTable::new(&classes(&[("idle", 0, 10, 0)]), SizingPolicy::Random)
            .unwrap_err();
        assert!(matches!(err, Error::NoWeightedSizeClass));

        let err = SizeTable::new(&BTreeMap::new(), SizingPolicy::Random).unwrap_err();
        assert!(matches!(err, Error::NoWeightedSizeClass));
    }

    #[test]
    fn rejects_oversized_total_weight() {
        let err = SizeTable::new(
            &classes(&[("huge", 0, 10, 1_000_000_000)]),
            SizingPolicy::Random,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::TotalWeightTooLarge { total: 1_000_000_000, max: MAX_TOTAL_WEIGHT }
        ));

        // The cap applies to the sum, not to individual classes.
        let half = (MAX_TOTAL_WEIGHT / 2 + 1) as u32;
        let err = SizeTable::new(
            &classes(&[("a", 0, 10, half), ("b", 10, 20, half)]),
            SizingPolicy::Random,
        )
        .unwrap_err();
        assert!(matches!(err, Error::TotalWeightTooLarge { .. }));

        let table = SizeTable::new(
            &classes(&[("max", 0, 10, MAX_TOTAL_WEIGHT as u32)]),
            SizingPolicy::Random,
        )
        .unwrap();
        assert_eq!(table.total_weight() as u64, MAX_TOTAL_WEIGHT);
    }

    #[test]
    fn classifies_lengths() {
        let table = SizeTable::new(
            &classes(&[("small", 0, 1024, 1), ("medium", 1024, 4096, 1)]),
            SizingPolicy::Random,
        )
        .unwrap();

        assert_eq!(table.classify(0), "small");
        assert_eq!(table.classify(1023), "small");
        assert_eq!(table.classify(1024), "medium");
        assert_eq!(table.classify(4096), UNCLASSIFIED);
    }
}
