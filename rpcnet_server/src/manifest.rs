//! Manifest registry: the server-side source of truth for which grain type
//! backs each interface, sent to clients once per session in
//! `HandshakeAck` (§3, §4.1).

use rpcnet_core::message::Manifest;

#[derive(Default, Clone)]
pub struct ManifestRegistry {
    manifest: Manifest,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, interface: impl Into<String>, grain_type: impl Into<String>) -> &mut Self {
        self.manifest.bind(interface, grain_type);
        self
    }

    pub fn set_grain_property(
        &mut self,
        grain_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.manifest
            .grain_properties
            .entry(grain_type.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn set_interface_property(
        &mut self,
        interface: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.manifest
            .interface_properties
            .entry(interface.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn build(&self) -> Manifest {
        self.manifest.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_build_roundtrips() {
        let mut registry = ManifestRegistry::new();
        registry.bind("IPing", "PingGrain");
        registry.set_grain_property("PingGrain", "grain_types", "Ping");
        let manifest = registry.build();
        assert_eq!(manifest.grain_type_for("IPing"), Some(&"PingGrain".to_string()));
        assert_eq!(
            manifest.grain_properties.get("PingGrain").and_then(|m| m.get("grain_types")),
            Some(&"Ping".to_string())
        );
    }
}
