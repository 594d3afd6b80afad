//! Host-side stand-ins for remote entities.
//!
//! A proxy is the local face of one entity living on a connected app: it
//! reads state through the bridge handle and turns host interactions into
//! fire-and-forget commands.

use crate::dispatch::BridgeEvent;
use crate::entity::{AttrMap, AttrValue, Domain};
use crate::event_loop::BridgeHandle;
use crate::session::SessionStatus;
use anyhow::{bail, Result};

/// What one entity domain can do: which attribute carries its state and
/// which commands it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub domain: Domain,
    pub state_field: &'static str,
    pub commands: &'static [&'static str],
}

const DESCRIPTORS: &[DomainDescriptor] = &[
    DomainDescriptor {
        domain: Domain::BinarySensor,
        state_field: "is_on",
        commands: &[],
    },
    DomainDescriptor {
        domain: Domain::Button,
        state_field: "is_on",
        commands: &["press"],
    },
    DomainDescriptor {
        domain: Domain::Lock,
        state_field: "is_locked",
        commands: &["lock", "unlock", "open"],
    },
    DomainDescriptor {
        domain: Domain::Number,
        state_field: "native_value",
        commands: &["set_value"],
    },
    DomainDescriptor {
        domain: Domain::Select,
        state_field: "current_option",
        commands: &["select_option"],
    },
    DomainDescriptor {
        domain: Domain::Sensor,
        state_field: "native_value",
        commands: &[],
    },
    DomainDescriptor {
        domain: Domain::Switch,
        state_field: "is_on",
        commands: &["turn_on", "turn_off"],
    },
    DomainDescriptor {
        domain: Domain::Text,
        state_field: "native_value",
        commands: &["set_value"],
    },
];

pub fn descriptor(domain: Domain) -> &'static DomainDescriptor {
    match domain {
        Domain::BinarySensor => &DESCRIPTORS[0],
        Domain::Button => &DESCRIPTORS[1],
        Domain::Lock => &DESCRIPTORS[2],
        Domain::Number => &DESCRIPTORS[3],
        Domain::Select => &DESCRIPTORS[4],
        Domain::Sensor => &DESCRIPTORS[5],
        Domain::Switch => &DESCRIPTORS[6],
        Domain::Text => &DESCRIPTORS[7],
    }
}

/// Local face of one remote entity.
#[derive(Clone)]
pub struct ProxyEntity {
    unique_id: String,
    app: String,
    descriptor: &'static DomainDescriptor,
    handle: BridgeHandle,
}

impl ProxyEntity {
    pub fn new(handle: BridgeHandle, app: &str, unique_id: &str, domain: Domain) -> Self {
        Self {
            unique_id: unique_id.to_owned(),
            app: app.to_owned(),
            descriptor: descriptor(domain),
            handle,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn descriptor(&self) -> &DomainDescriptor {
        self.descriptor
    }

    /// An entity is available while its owning session is online and it has
    /// not been disabled.
    pub async fn available(&self) -> bool {
        match self.handle.entity(self.unique_id.clone()).await {
            Ok(Some((record, status))) => status == SessionStatus::Online && !record.disabled,
            _ => false,
        }
    }

    /// Current value of the domain's state attribute.
    pub async fn state(&self) -> Result<Option<AttrValue>> {
        let entity = self.handle.entity(self.unique_id.clone()).await?;
        Ok(entity
            .and_then(|(record, _)| record.attributes.get(self.descriptor.state_field).cloned()))
    }

    pub async fn attribute(&self, key: &str) -> Result<Option<AttrValue>> {
        let entity = self.handle.entity(self.unique_id.clone()).await?;
        Ok(entity.and_then(|(record, _)| record.attributes.get(key).cloned()))
    }

    pub fn supports(&self, command: &str) -> bool {
        self.descriptor.commands.contains(&command)
    }

    /// Sends a command to the remote entity. No delivery guarantee; a user
    /// seeing no effect retries through the same path.
    pub async fn invoke(&self, command: &str, args: AttrMap) -> Result<()> {
        if !self.supports(command) {
            bail!(
                "entity {} ({}) does not support command {command}",
                self.unique_id,
                self.descriptor.domain
            );
        }
        self.handle
            .send_command(
                self.app.clone(),
                command.to_owned(),
                self.unique_id.clone(),
                args,
            )
            .await
    }

    /// Whether an event from this proxy's app concerns this entity.
    pub fn applies_to(&self, event: &BridgeEvent) -> bool {
        match event.unique_id() {
            Some(unique_id) => unique_id == self.unique_id,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_domain_has_a_descriptor() {
        for domain in [
            Domain::BinarySensor,
            Domain::Button,
            Domain::Lock,
            Domain::Number,
            Domain::Select,
            Domain::Sensor,
            Domain::Switch,
            Domain::Text,
        ] {
            assert_eq!(descriptor(domain).domain, domain);
        }
    }

    #[test]
    fn sensors_accept_no_commands() {
        assert!(descriptor(Domain::Sensor).commands.is_empty());
        assert!(descriptor(Domain::BinarySensor).commands.is_empty());
    }

    #[test]
    fn switch_state_lives_in_is_on() {
        let descriptor = descriptor(Domain::Switch);

        assert_eq!(descriptor.state_field, "is_on");
        assert!(descriptor.commands.contains(&"turn_on"));
        assert!(descriptor.commands.contains(&"turn_off"));
    }
}
