// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # PII/PHI Masking Transformer
//!
//! One-way anonymization of sensitive columns before events leave the
//! pipeline. Masking applies to the `columns` map only - partition and
//! clustering keys are never masked, because destinations key their
//! idempotent upserts on them.
//!
//! ## Classification
//!
//! Column names are matched against two ordered rule lists by
//! case-insensitive substring. PHI patterns are checked first (they are the
//! more sensitive class); PII second; everything else passes through.
//!
//! ## Strategies
//!
//! - **PII-Hash**: the value is replaced by the hex SHA-256 digest of the
//!   UTF-8 bytes of its plain-string rendering. `null` passes through; an
//!   empty string hashes to the digest of the empty byte string.
//! - **PHI-Token**: the value is replaced by the hex HMAC-SHA-256 of the
//!   same bytes under a process-wide secret key. The secret is mandatory
//!   whenever a PHI rule is active - tokenization without a secret would
//!   just be a public hash.
//!
//! Both strategies are deterministic: the same value under the same
//! configuration always yields the same output, which is what keeps
//! destination-side joins on masked columns possible.
//!
//! ## Reload
//!
//! The rule lists can be replaced at runtime via
//! [`MaskingTransformer::reload`]; the transformer owns its rules behind a
//! lock rather than consulting a global.

use parking_lot::RwLock;
use ring::hmac;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use cdc_relay_domain::entities::change_event::{value_to_plain_string, ColumnMap};
use cdc_relay_domain::PipelineError;

use crate::infrastructure::config::settings::MaskingSettings;

/// Masking strategy for one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskingStrategy {
    /// Pass the value through untouched.
    None,
    /// Replace with the hex SHA-256 digest of the value.
    PiiHash,
    /// Replace with the hex HMAC-SHA-256 token of the value.
    PhiToken,
}

/// Ordered masking rule lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskingRules {
    pii_patterns: Vec<String>,
    phi_patterns: Vec<String>,
}

impl MaskingRules {
    /// Creates a rule set; patterns are lowercased once here so per-column
    /// classification only lowercases the column name.
    pub fn new(pii_patterns: Vec<String>, phi_patterns: Vec<String>) -> Self {
        Self {
            pii_patterns: pii_patterns.into_iter().map(|p| p.to_lowercase()).collect(),
            phi_patterns: phi_patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// Whether any PHI rule is configured.
    pub fn has_phi_rules(&self) -> bool {
        !self.phi_patterns.is_empty()
    }

    /// Classifies a column name. PHI first, then PII, then none.
    pub fn classify(&self, column_name: &str) -> MaskingStrategy {
        let name = column_name.to_lowercase();

        for pattern in &self.phi_patterns {
            if name.contains(pattern) {
                return MaskingStrategy::PhiToken;
            }
        }

        for pattern in &self.pii_patterns {
            if name.contains(pattern) {
                return MaskingStrategy::PiiHash;
            }
        }

        MaskingStrategy::None
    }
}

/// Applies masking rules to event columns.
pub struct MaskingTransformer {
    rules: RwLock<MaskingRules>,
    phi_key: Option<hmac::Key>,
}

impl MaskingTransformer {
    /// Builds a transformer from configuration.
    ///
    /// Fails with a configuration error when PHI rules are present without
    /// a secret.
    pub fn new(settings: &MaskingSettings) -> Result<Self, PipelineError> {
        let rules = MaskingRules::new(
            settings.pii_patterns.clone(),
            settings.phi_patterns.clone(),
        );

        let phi_key = match (&settings.phi_secret, rules.has_phi_rules()) {
            (Some(secret), _) => Some(hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes())),
            (None, true) => {
                return Err(PipelineError::invalid_config(
                    "PHI masking rules configured without masking.phi_secret",
                ))
            }
            (None, false) => None,
        };

        info!(
            pii_rules = rules.pii_patterns.len(),
            phi_rules = rules.phi_patterns.len(),
            "Masking rules loaded"
        );

        Ok(Self {
            rules: RwLock::new(rules),
            phi_key,
        })
    }

    /// Replaces the active rule lists.
    ///
    /// Rejects PHI rules when the transformer was built without a secret;
    /// the secret itself is process-wide and not reloadable.
    pub fn reload(
        &self,
        pii_patterns: Vec<String>,
        phi_patterns: Vec<String>,
    ) -> Result<(), PipelineError> {
        let rules = MaskingRules::new(pii_patterns, phi_patterns);
        if rules.has_phi_rules() && self.phi_key.is_none() {
            return Err(PipelineError::invalid_config(
                "cannot enable PHI rules: no masking.phi_secret was configured",
            ));
        }
        let (pii, phi) = (rules.pii_patterns.len(), rules.phi_patterns.len());
        *self.rules.write() = rules;
        info!(pii_rules = pii, phi_rules = phi, "Masking rules reloaded");
        Ok(())
    }

    /// Classifies a column under the active rules.
    pub fn classify(&self, column_name: &str) -> MaskingStrategy {
        self.rules.read().classify(column_name)
    }

    /// Applies masking to a column map, returning the masked copy.
    pub fn apply(&self, columns: &ColumnMap) -> Result<ColumnMap, PipelineError> {
        let rules = self.rules.read();
        let mut masked = ColumnMap::with_capacity(columns.len());

        for (name, value) in columns {
            let replacement = match rules.classify(name) {
                MaskingStrategy::None => value.clone(),
                MaskingStrategy::PiiHash => {
                    debug!(column = %name, "Masking PII column");
                    mask_pii(value)
                }
                MaskingStrategy::PhiToken => {
                    debug!(column = %name, "Masking PHI column");
                    self.mask_phi(value)?
                }
            };
            masked.insert(name.clone(), replacement);
        }

        Ok(masked)
    }

    fn mask_phi(&self, value: &Value) -> Result<Value, PipelineError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let key = self.phi_key.as_ref().ok_or_else(|| {
            PipelineError::invalid_config("PHI column encountered without masking.phi_secret")
        })?;
        let plain = value_to_plain_string(value);
        let tag = hmac::sign(key, plain.as_bytes());
        Ok(Value::String(hex::encode(tag.as_ref())))
    }
}

/// SHA-256 hex digest of the value's plain-string rendering; null passes.
fn mask_pii(value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    let plain = value_to_plain_string(value);
    let digest = Sha256::digest(plain.as_bytes());
    Value::String(format!("{:x}", digest))
}
