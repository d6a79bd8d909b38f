//! The declarative metric registry (`metrics.yaml`).

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use ethpulse_core::{AnchorDate, HistoryMode, MetricSpec, TierSpec};
use ethpulse_storage::validate_identifier;
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct MetricRegistry {
    pub metrics: Vec<MetricSpec>,
}

impl MetricRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing metric registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&MetricSpec> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Metrics named in `only`, in registry order; all metrics when `only` is empty.
    pub fn select(&self, only: &[String]) -> Result<Vec<MetricSpec>> {
        if only.is_empty() {
            return Ok(self.metrics.clone());
        }
        let unknown: Vec<&str> = only
            .iter()
            .filter(|name| self.get(name).is_none())
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            bail!("unknown metric(s): {}", unknown.join(", "));
        }
        Ok(self
            .metrics
            .iter()
            .filter(|m| only.contains(&m.name))
            .cloned()
            .collect())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.metrics.is_empty(), "registry declares no metrics");
        let mut names = BTreeSet::new();
        let mut tables = BTreeSet::new();
        for metric in &self.metrics {
            ensure!(names.insert(metric.name.as_str()), "duplicate metric {}", metric.name);
            ensure!(tables.insert(metric.table.as_str()), "duplicate table {}", metric.table);
            validate_metric(metric).with_context(|| format!("metric {}", metric.name))?;
        }

        for metric in &self.metrics {
            for tier in &metric.tiers {
                if let TierSpec::Derived(derived) = tier {
                    let source = self
                        .metrics
                        .iter()
                        .find(|m| m.table == derived.from_table)
                        .with_context(|| {
                            format!(
                                "metric {}: derived tier reads unknown table {}",
                                metric.name, derived.from_table
                            )
                        })?;
                    ensure!(
                        !source.has_derived_tier(),
                        "metric {}: derived tier reads another derived metric",
                        metric.name
                    );
                    ensure!(
                        source.field(&derived.from_field).is_some(),
                        "metric {}: table {} has no field {}",
                        metric.name,
                        derived.from_table,
                        derived.from_field
                    );
                }
            }
        }
        Ok(())
    }
}

fn validate_metric(metric: &MetricSpec) -> Result<()> {
    validate_identifier(&metric.table)?;
    ensure!(!metric.fields.is_empty(), "no fields declared");
    ensure!(!metric.tiers.is_empty(), "no tiers declared");
    for field in &metric.fields {
        validate_identifier(&field.name)?;
        ensure!(
            !matches!(
                field.name.as_str(),
                "date" | "timestamp" | "dimension" | "source" | "updated_at"
            ),
            "field name {} is reserved",
            field.name
        );
    }

    if metric.is_composite() {
        ensure!(!metric.dimensions.is_empty(), "composite key without dimensions");
    } else {
        ensure!(metric.dimensions.is_empty(), "dimensions declared on a date-keyed metric");
    }

    let mut seen_synthetic = false;
    for tier in &metric.tiers {
        if tier.is_synthetic() {
            seen_synthetic = true;
        } else {
            ensure!(
                !seen_synthetic,
                "live tier {} declared after a synthetic tier",
                tier.source()
            );
        }
        validate_reaches_today(tier).with_context(|| format!("tier {}", tier.source()))?;
        for produced in tier.produced_fields() {
            ensure!(
                metric.field(produced).is_some(),
                "tier {} produces undeclared field {}",
                tier.source(),
                produced
            );
        }
    }

    if metric.history == HistoryMode::Long && !metric.is_composite() && !metric.has_derived_tier()
    {
        ensure!(
            metric.tiers.last().is_some_and(TierSpec::is_synthetic),
            "long-history metric has no terminal interpolate or regime tier"
        );
    }

    if let Some(enrichment) = &metric.enrichment {
        ensure!(
            matches!(enrichment, TierSpec::RestJson(_) | TierSpec::Csv(_)),
            "enrichment must be a live tier"
        );
    }
    Ok(())
}

/// Synthetic tiers must reach the run's today, or the fallback can come up empty.
fn validate_reaches_today(tier: &TierSpec) -> Result<()> {
    match tier {
        TierSpec::Interpolate(t) => ensure!(
            t.anchors.len() >= 2
                && t.anchors.last().is_some_and(|a| a.date == AnchorDate::Today),
            "interpolate tier needs two or more anchors ending on `today`"
        ),
        TierSpec::Regime(t) => ensure!(
            t.regimes.last().is_some_and(|r| r.to.is_none()),
            "last regime must be open-ended"
        ),
        _ => {}
    }
    Ok(())
}
