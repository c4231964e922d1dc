//! Layer-2 trigger rules and their evaluation.
//!
//! A rule compares one statistic against a threshold with `>=`/`<=`
//! semantics: a value exactly at the threshold fires, including zero.
//! Rise and fall rules are independent and combine disjunctively.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::types::{PriceStat, StatWindow, TriggeredRule};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Any enabled rule firing admits the event.
    Any,
    /// Every enabled rule must fire.
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerRule {
    PriceRise { window: StatWindow, min_pct: Decimal },
    PriceFall { window: StatWindow, min_pct: Decimal },
    Volume { window: StatWindow, min_usd: Decimal },
    Top10Concentration { window: StatWindow, max_pct: Decimal },
}

impl TriggerRule {
    pub fn window(&self) -> StatWindow {
        match self {
            TriggerRule::PriceRise { window, .. }
            | TriggerRule::PriceFall { window, .. }
            | TriggerRule::Volume { window, .. }
            | TriggerRule::Top10Concentration { window, .. } => *window,
        }
    }

    /// Evaluate against the statistics of this rule's window.
    pub fn evaluate(&self, stat: &PriceStat) -> Option<TriggeredRule> {
        match self {
            TriggerRule::PriceRise { window, min_pct } => {
                if stat.price_change_pct >= *min_pct {
                    Some(TriggeredRule {
                        description: format!(
                            "{} price rise {:+.2}% (>= {}%)",
                            window.as_str(),
                            stat.price_change_pct,
                            min_pct
                        ),
                        value: stat.price_change_pct,
                        threshold: *min_pct,
                    })
                } else {
                    None
                }
            }
            TriggerRule::PriceFall { window, min_pct } => {
                if stat.price_change_pct <= -*min_pct {
                    Some(TriggeredRule {
                        description: format!(
                            "{} price fall {:.2}% (<= -{}%)",
                            window.as_str(),
                            stat.price_change_pct,
                            min_pct
                        ),
                        value: stat.price_change_pct,
                        threshold: -*min_pct,
                    })
                } else {
                    None
                }
            }
            TriggerRule::Volume { window, min_usd } => {
                if stat.volume_usd >= *min_usd {
                    Some(TriggeredRule {
                        description: format!(
                            "{} volume ${:.0} (>= ${})",
                            window.as_str(),
                            stat.volume_usd,
                            min_usd
                        ),
                        value: stat.volume_usd,
                        threshold: *min_usd,
                    })
                } else {
                    None
                }
            }
            TriggerRule::Top10Concentration { window, max_pct } => {
                if stat.top10_pct <= *max_pct {
                    Some(TriggeredRule {
                        description: format!(
                            "{} top-10 holders {:.1}% (<= {}%)",
                            window.as_str(),
                            stat.top10_pct,
                            max_pct
                        ),
                        value: stat.top10_pct,
                        threshold: *max_pct,
                    })
                } else {
                    None
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rule sets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RuleSet {
    pub mode: TriggerMode,
    pub rules: Vec<TriggerRule>,
}

impl RuleSet {
    /// Distinct windows the rules need statistics for, narrowest first.
    pub fn windows(&self) -> Vec<StatWindow> {
        let mut windows: Vec<StatWindow> = self.rules.iter().map(|r| r.window()).collect();
        windows.sort();
        windows.dedup();
        windows
    }

    /// Evaluate all rules against the fetched statistics.
    ///
    /// `stats` is keyed by the *requested* window; fallback widening swaps
    /// the stat behind a key but not the key itself.
    pub fn evaluate(&self, stats: &HashMap<StatWindow, PriceStat>) -> (bool, Vec<TriggeredRule>) {
        let mut fired = Vec::new();
        let mut all_fired = !self.rules.is_empty();

        for rule in &self.rules {
            match stats.get(&rule.window()).and_then(|s| rule.evaluate(s)) {
                Some(event) => fired.push(event),
                None => all_fired = false,
            }
        }

        let triggered = match self.mode {
            TriggerMode::Any => !fired.is_empty(),
            TriggerMode::All => all_fired,
        };
        (triggered, fired)
    }
}

// ---------------------------------------------------------------------------
// Config template (the shape stored in the KV store)
// ---------------------------------------------------------------------------

/// Serialized rule template, as written by the config service.
///
/// ```json
/// {
///   "trigger": "any",
///   "window": "1m",
///   "priceChange": { "risePercent": 20, "fallPercent": 30 },
///   "volume": { "threshold": 5000 },
///   "top10": { "maxPercent": 30 }
/// }
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuleTemplate {
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub window: Option<String>,
    #[serde(rename = "priceChange", default)]
    pub price_change: Option<PriceChangeTemplate>,
    #[serde(default)]
    pub volume: Option<VolumeTemplate>,
    #[serde(default)]
    pub top10: Option<Top10Template>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PriceChangeTemplate {
    #[serde(rename = "risePercent", default)]
    pub rise_percent: Option<f64>,
    #[serde(rename = "fallPercent", default)]
    pub fall_percent: Option<f64>,
    #[serde(default)]
    pub window: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VolumeTemplate {
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub window: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Top10Template {
    #[serde(rename = "maxPercent", default)]
    pub max_percent: Option<f64>,
    #[serde(default)]
    pub window: Option<String>,
}

impl RuleTemplate {
    /// Materialize the template into an evaluable rule set.
    pub fn into_rule_set(self) -> RuleSet {
        let default_window = self
            .window
            .as_deref()
            .and_then(StatWindow::parse)
            .unwrap_or(StatWindow::OneMinute);
        let mode = match self.trigger.as_deref() {
            Some("all") => TriggerMode::All,
            _ => TriggerMode::Any,
        };

        let window_of = |s: &Option<String>| {
            s.as_deref()
                .and_then(StatWindow::parse)
                .unwrap_or(default_window)
        };

        let mut rules = Vec::new();
        if let Some(pc) = &self.price_change {
            let window = window_of(&pc.window);
            if let Some(rise) = pc.rise_percent.and_then(to_decimal) {
                rules.push(TriggerRule::PriceRise {
                    window,
                    min_pct: rise,
                });
            }
            if let Some(fall) = pc.fall_percent.and_then(to_decimal) {
                rules.push(TriggerRule::PriceFall {
                    window,
                    min_pct: fall,
                });
            }
        }
        if let Some(vol) = &self.volume {
            if let Some(threshold) = vol.threshold.and_then(to_decimal) {
                rules.push(TriggerRule::Volume {
                    window: window_of(&vol.window),
                    min_usd: threshold,
                });
            }
        }
        if let Some(top10) = &self.top10 {
            if let Some(max) = top10.max_percent.and_then(to_decimal) {
                rules.push(TriggerRule::Top10Concentration {
                    window: window_of(&top10.window),
                    max_pct: max,
                });
            }
        }

        RuleSet { mode, rules }
    }
}

pub(crate) fn to_decimal(value: f64) -> Option<Decimal> {
    Decimal::try_from(value).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Completeness;
    use alloy::primitives::Address;
    use rust_decimal_macros::dec;

    fn stat(window: StatWindow, price_change: Decimal, volume: Decimal) -> PriceStat {
        PriceStat {
            token: Address::ZERO,
            window,
            symbol: "TKN".into(),
            price_usd: dec!(0.01),
            price_change_pct: price_change,
            volume_usd: volume,
            tx_count: 10,
            top10_pct: dec!(25),
            market_cap_usd: dec!(100000),
            completeness: Completeness::Complete,
        }
    }

    fn stats_for(window: StatWindow, s: PriceStat) -> HashMap<StatWindow, PriceStat> {
        let mut map = HashMap::new();
        map.insert(window, s);
        map
    }

    #[test]
    fn test_rise_rule_fires_at_threshold() {
        let rule = TriggerRule::PriceRise {
            window: StatWindow::OneMinute,
            min_pct: dec!(20),
        };
        let w = StatWindow::OneMinute;

        assert!(rule.evaluate(&stat(w, dec!(22), dec!(0))).is_some());
        // Exactly at threshold fires.
        assert!(rule.evaluate(&stat(w, dec!(20), dec!(0))).is_some());
        assert!(rule.evaluate(&stat(w, dec!(19.99), dec!(0))).is_none());
    }

    #[test]
    fn test_zero_threshold_admits_zero_value() {
        let rule = TriggerRule::PriceRise {
            window: StatWindow::OneMinute,
            min_pct: Decimal::ZERO,
        };
        assert!(rule
            .evaluate(&stat(StatWindow::OneMinute, Decimal::ZERO, dec!(0)))
            .is_some());
    }

    #[test]
    fn test_fall_rule() {
        let rule = TriggerRule::PriceFall {
            window: StatWindow::FiveMinutes,
            min_pct: dec!(30),
        };
        let w = StatWindow::FiveMinutes;

        assert!(rule.evaluate(&stat(w, dec!(-35), dec!(0))).is_some());
        assert!(rule.evaluate(&stat(w, dec!(-30), dec!(0))).is_some());
        assert!(rule.evaluate(&stat(w, dec!(-29), dec!(0))).is_none());
        assert!(rule.evaluate(&stat(w, dec!(35), dec!(0))).is_none());
    }

    #[test]
    fn test_rise_and_fall_are_disjunctive() {
        let set = RuleSet {
            mode: TriggerMode::Any,
            rules: vec![
                TriggerRule::PriceRise {
                    window: StatWindow::OneMinute,
                    min_pct: dec!(20),
                },
                TriggerRule::PriceFall {
                    window: StatWindow::OneMinute,
                    min_pct: dec!(20),
                },
            ],
        };

        let (up, fired) = set.evaluate(&stats_for(
            StatWindow::OneMinute,
            stat(StatWindow::OneMinute, dec!(25), dec!(0)),
        ));
        assert!(up);
        assert_eq!(fired.len(), 1);

        let (down, _) = set.evaluate(&stats_for(
            StatWindow::OneMinute,
            stat(StatWindow::OneMinute, dec!(-25), dec!(0)),
        ));
        assert!(down);
    }

    #[test]
    fn test_all_mode_requires_every_rule() {
        let set = RuleSet {
            mode: TriggerMode::All,
            rules: vec![
                TriggerRule::PriceRise {
                    window: StatWindow::OneMinute,
                    min_pct: dec!(20),
                },
                TriggerRule::Volume {
                    window: StatWindow::OneMinute,
                    min_usd: dec!(5000),
                },
            ],
        };

        // Only the rise fires: rejected.
        let (ok, _) = set.evaluate(&stats_for(
            StatWindow::OneMinute,
            stat(StatWindow::OneMinute, dec!(25), dec!(1000)),
        ));
        assert!(!ok);

        // Both fire: admitted.
        let (ok, fired) = set.evaluate(&stats_for(
            StatWindow::OneMinute,
            stat(StatWindow::OneMinute, dec!(25), dec!(9000)),
        ));
        assert!(ok);
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn test_missing_stat_blocks_all_mode() {
        let set = RuleSet {
            mode: TriggerMode::All,
            rules: vec![TriggerRule::Volume {
                window: StatWindow::OneHour,
                min_usd: dec!(1),
            }],
        };
        let (ok, fired) = set.evaluate(&HashMap::new());
        assert!(!ok);
        assert!(fired.is_empty());
    }

    #[test]
    fn test_empty_rule_set_never_triggers() {
        let set = RuleSet {
            mode: TriggerMode::All,
            rules: vec![],
        };
        let (ok, _) = set.evaluate(&HashMap::new());
        assert!(!ok);
    }

    #[test]
    fn test_template_parse() {
        let json = r#"{
            "trigger": "any",
            "window": "1m",
            "priceChange": { "risePercent": 20 },
            "volume": { "threshold": 5000, "window": "5m" }
        }"#;
        let template: RuleTemplate = serde_json::from_str(json).unwrap();
        let set = template.into_rule_set();

        assert_eq!(set.mode, TriggerMode::Any);
        assert_eq!(set.rules.len(), 2);
        assert_eq!(
            set.rules[0],
            TriggerRule::PriceRise {
                window: StatWindow::OneMinute,
                min_pct: dec!(20),
            }
        );
        assert_eq!(
            set.rules[1],
            TriggerRule::Volume {
                window: StatWindow::FiveMinutes,
                min_usd: dec!(5000),
            }
        );
        assert_eq!(
            set.windows(),
            vec![StatWindow::OneMinute, StatWindow::FiveMinutes]
        );
    }
}
