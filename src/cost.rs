use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::{PricingConfig, RateOverride};
use crate::model::TokenUsage;

pub const DEFAULT_FAMILY: &str = "sonnet";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelRates {
    pub input: Option<f64>,
    pub output: Option<f64>,
    pub cache_read: Option<f64>,
    pub cache_creation: Option<f64>,
}

impl ModelRates {
    pub const fn new(input: f64, output: f64, cache_read: f64, cache_creation: f64) -> Self {
        Self {
            input: Some(input),
            output: Some(output),
            cache_read: Some(cache_read),
            cache_creation: Some(cache_creation),
        }
    }

    pub fn cost(&self, tokens: &TokenUsage) -> f64 {
        per_million(tokens.input, self.input)
            + per_million(tokens.output, self.output)
            + per_million(tokens.cache_read, self.cache_read)
            + per_million(tokens.cache_creation, self.cache_creation)
    }
}

fn per_million(count: u64, rate: Option<f64>) -> f64 {
    match rate {
        Some(rate) if rate.is_finite() && rate > 0.0 => (count as f64 / 1_000_000.0) * rate,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    Exact,
    Alias,
    Override,
    #[default]
    Fallback,
}

#[derive(Debug, Clone)]
pub struct RateResolution {
    pub family: String,
    pub rates: ModelRates,
    pub source: RateSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateTable {
    families: BTreeMap<String, ModelRates>,
    aliases: BTreeMap<String, String>,
    overridden: BTreeSet<String>,
    default_family: String,
}

impl Default for RateTable {
    fn default() -> Self {
        let mut families = BTreeMap::new();
        families.insert("opus".to_string(), ModelRates::new(15.0, 75.0, 1.5, 18.75));
        families.insert("sonnet".to_string(), ModelRates::new(3.0, 15.0, 0.3, 3.75));
        families.insert("haiku".to_string(), ModelRates::new(1.0, 5.0, 0.1, 1.25));
        Self {
            families,
            aliases: BTreeMap::new(),
            overridden: BTreeSet::new(),
            default_family: DEFAULT_FAMILY.to_string(),
        }
    }
}

impl RateTable {
    pub fn from_config(pricing: &PricingConfig) -> Self {
        let mut table = Self::default();
        for (family, entry) in &pricing.overrides {
            let key = normalize_model_key(family);
            let Some(rates) = validated_override(entry) else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            table.families.insert(key.clone(), rates);
            table.overridden.insert(key);
        }
        for (marker, family) in &pricing.aliases {
            let marker = normalize_model_key(marker);
            let family = normalize_model_key(family);
            if marker.is_empty() || !table.families.contains_key(&family) {
                continue;
            }
            table.aliases.insert(marker, family);
        }
        table
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }

    pub fn resolve(&self, model: &str) -> RateResolution {
        let key = normalize_model_key(model);

        if let Some(family) = longest_marker(&key, self.aliases.iter())
            && let Some(rates) = self.families.get(family)
        {
            return RateResolution {
                family: family.clone(),
                rates: *rates,
                source: if self.overridden.contains(family) {
                    RateSource::Override
                } else {
                    RateSource::Alias
                },
            };
        }

        if let Some(family) = longest_marker(&key, self.families.keys().map(|k| (k, k)))
            && let Some(rates) = self.families.get(family)
        {
            return RateResolution {
                family: family.clone(),
                rates: *rates,
                source: if self.overridden.contains(family) {
                    RateSource::Override
                } else {
                    RateSource::Exact
                },
            };
        }

        RateResolution {
            family: self.default_family.clone(),
            rates: self
                .families
                .get(&self.default_family)
                .copied()
                .unwrap_or_default(),
            source: RateSource::Fallback,
        }
    }

    pub fn family_of(&self, model: &str) -> String {
        self.resolve(model).family
    }

    pub fn cost(&self, tokens: &TokenUsage, model: &str) -> f64 {
        self.resolve(model).rates.cost(tokens)
    }

    pub fn family_cost(&self, family: &str, tokens: &TokenUsage) -> f64 {
        match self.families.get(family) {
            Some(rates) => rates.cost(tokens),
            None => self.cost(tokens, family),
        }
    }
}

fn longest_marker<'a, I>(key: &str, markers: I) -> Option<&'a String>
where
    I: Iterator<Item = (&'a String, &'a String)>,
{
    markers
        .filter(|(marker, _)| !marker.is_empty() && key.contains(marker.as_str()))
        .max_by_key(|(marker, _)| marker.len())
        .map(|(_, family)| family)
}

fn validated_override(entry: &RateOverride) -> Option<ModelRates> {
    let valid = |rate: f64| rate.is_finite() && rate >= 0.0;
    if !valid(entry.input_per_million) || !valid(entry.output_per_million) {
        return None;
    }
    Some(ModelRates {
        input: Some(entry.input_per_million),
        output: Some(entry.output_per_million),
        cache_read: entry.cache_read_per_million.filter(|rate| valid(*rate)),
        cache_creation: entry.cache_creation_per_million.filter(|rate| valid(*rate)),
    })
}

pub fn normalize_model_key(model: &str) -> String {
    model.trim().to_ascii_lowercase()
}
