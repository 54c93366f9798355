//! Per-module capability offers and their activation state.

use indexmap::IndexMap;
use modlink_protocol::{CapabilityId, ModuleCapability, ModulePhase, ProtocolError, ProtocolResult};

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityRecord {
    pub capability: ModuleCapability,
    pub active: bool,
    pub awaiting_configuration: bool,
    /// Reason given with the last `active: false`.
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOutcome {
    pub needs_configuration: bool,
    /// The capability id was already offered and has been replaced.
    pub replaced: bool,
}

/// Capabilities are independent of each other: one awaiting configuration
/// or failing never affects another.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    records: IndexMap<CapabilityId, CapabilityRecord>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept an offer in `prepared`, `configured` or `ready`. An offer that
    /// still needs configuration is refused once the module is ready.
    pub fn offer(
        &mut self,
        phase: ModulePhase,
        capability: ModuleCapability,
        config_settled: bool,
    ) -> ProtocolResult<OfferOutcome> {
        if !matches!(
            phase,
            ModulePhase::Prepared | ModulePhase::Configured | ModulePhase::Ready
        ) {
            return Err(ProtocolError::OfferRejected(format!(
                "{} cannot be offered while the module is {phase}",
                capability.id
            )));
        }

        let needs_configuration = capability.config_schema.is_some() && !config_settled;
        if needs_configuration && phase == ModulePhase::Ready {
            return Err(ProtocolError::OfferRejected(format!(
                "{} requires configuration but the module is already ready",
                capability.id
            )));
        }

        let id = capability.id.clone();
        let replaced = self
            .records
            .insert(
                id,
                CapabilityRecord {
                    capability,
                    active: false,
                    awaiting_configuration: needs_configuration,
                    failure: None,
                },
            )
            .is_some();
        Ok(OfferOutcome {
            needs_configuration,
            replaced,
        })
    }

    pub fn mark_configured(&mut self, id: &CapabilityId) -> ProtocolResult<()> {
        let record = self.record_mut(id)?;
        record.awaiting_configuration = false;
        Ok(())
    }

    /// Flip activation without revoking the offer.
    pub fn activate(
        &mut self,
        id: &CapabilityId,
        active: bool,
        reason: Option<String>,
    ) -> ProtocolResult<()> {
        let record = self.record_mut(id)?;
        if active && record.awaiting_configuration {
            return Err(ProtocolError::OfferRejected(format!(
                "{id} cannot activate before its configuration is committed"
            )));
        }
        record.active = active;
        record.failure = if active { None } else { reason };
        Ok(())
    }

    fn record_mut(&mut self, id: &CapabilityId) -> ProtocolResult<&mut CapabilityRecord> {
        self.records
            .get_mut(id)
            .ok_or_else(|| ProtocolError::CapabilityNotOffered(id.to_string()))
    }

    pub fn get(&self, id: &CapabilityId) -> Option<&CapabilityRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &CapabilityId) -> bool {
        self.records.contains_key(id)
    }

    pub fn awaiting_configuration(&self) -> Vec<CapabilityId> {
        self.records
            .values()
            .filter(|record| record.awaiting_configuration)
            .map(|record| record.capability.id.clone())
            .collect()
    }

    pub fn active_ids(&self) -> impl Iterator<Item = &CapabilityId> {
        self.records
            .values()
            .filter(|record| record.active)
            .map(|record| &record.capability.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityRecord> {
        self.records.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlink_protocol::ModuleConfigSchema;

    fn tts(with_schema: bool) -> ModuleCapability {
        let capability = ModuleCapability::new("tts");
        if with_schema {
            capability.with_config_schema(ModuleConfigSchema::new("tts", 1, None))
        } else {
            capability
        }
    }

    #[test]
    fn offers_are_phase_gated() {
        let mut set = CapabilitySet::new();
        assert!(set.offer(ModulePhase::Preparing, tts(false), true).is_err());
        assert!(set.offer(ModulePhase::Configured, tts(false), true).is_ok());
        assert!(matches!(
            set.offer(ModulePhase::Ready, tts(true), false),
            Err(ProtocolError::OfferRejected(_))
        ));
        let replaced = set.offer(ModulePhase::Ready, tts(true), true).unwrap();
        assert!(replaced.replaced);
        assert!(!replaced.needs_configuration);
    }

    #[test]
    fn activation_flips_without_revoking_the_offer() {
        let mut set = CapabilitySet::new();
        set.offer(ModulePhase::Prepared, tts(true), false).unwrap();
        assert_eq!(set.awaiting_configuration(), vec![CapabilityId::from("tts")]);
        assert!(set.activate(&"tts".into(), true, None).is_err());

        set.mark_configured(&"tts".into()).unwrap();
        set.activate(&"tts".into(), true, None).unwrap();
        assert_eq!(set.active_ids().count(), 1);

        set.activate(&"tts".into(), false, Some("device busy".into()))
            .unwrap();
        let record = set.get(&"tts".into()).unwrap();
        assert!(!record.active);
        assert_eq!(record.failure.as_deref(), Some("device busy"));
        assert!(set.contains(&"tts".into()));

        assert!(matches!(
            set.activate(&"stt".into(), true, None),
            Err(ProtocolError::CapabilityNotOffered(_))
        ));
    }
}
