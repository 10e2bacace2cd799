//! Guest environment checks: can commands run there, and are the guest-side
//! ports of bridged services listening.

use crate::{
    config::ServiceDescriptor,
    probe::Scope,
    state::{GuestReport, GuestServiceStatus},
};

use super::{ServiceId, Supervisor, ValidationError};

const REACHABILITY_CHECK: &str = "echo ok";

/// Port the service listens on inside the guest, if it runs there at all.
fn guest_port(descriptor: &ServiceDescriptor) -> Option<u16> {
    match descriptor.bridge {
        Some(bridge) => Some(bridge.guest_port),
        None if descriptor.detect_scope == Scope::Guest => Some(descriptor.port),
        None => None,
    }
}

impl Supervisor {
    /// Reports on the guest and on one guest service, or on all of them when `id` is `None`.
    pub async fn guest_status(
        &self,
        id: Option<ServiceId>,
    ) -> Result<GuestReport, ValidationError> {
        let targets: Vec<(&ServiceDescriptor, u16)> = match id {
            Some(id) => {
                let descriptor = self.descriptor(id);
                let port = guest_port(descriptor)
                    .ok_or_else(|| ValidationError::NotInGuest(descriptor.name.clone()))?;
                vec![(descriptor, port)]
            }
            None => self
                .slots
                .iter()
                .filter_map(|slot| Some((&slot.descriptor, guest_port(&slot.descriptor)?)))
                .collect(),
        };

        let mut report = GuestReport {
            distros: self.guest_distros().await,
            ..GuestReport::default()
        };

        match self.probe.execute_in_guest(REACHABILITY_CHECK).await {
            Ok(output) if output.success() => report.available = true,
            Ok(output) => {
                report.error = Some(format!(
                    "guest check exited with status {:?}: {}",
                    output.code,
                    output.stderr.trim()
                ));
            }
            Err(error) => report.error = Some(error.to_string()),
        }

        if !report.available {
            tracing::info!(error = ?report.error, "guest environment unreachable");
            report.services = targets
                .into_iter()
                .map(|(descriptor, guest_port)| {
                    let status = GuestServiceStatus {
                        guest_port,
                        listening: None,
                    };
                    (descriptor.name.clone(), status)
                })
                .collect();
            return Ok(report);
        }

        report.address = match self.probe.resolve_guest_address().await {
            Ok(address) => Some(address.to_string()),
            Err(error) => {
                tracing::warn!(%error, "guest address unavailable");
                None
            }
        };

        for (descriptor, guest_port) in targets {
            let listening = match self.probe.is_port_in_use(guest_port, Scope::Guest).await {
                Ok(usage) => Some(usage.in_use),
                Err(error) => {
                    tracing::warn!(%error, service = %descriptor.name, port = guest_port, "could not inspect guest port");
                    None
                }
            };
            report.services.insert(
                descriptor.name.clone(),
                GuestServiceStatus {
                    guest_port,
                    listening,
                },
            );
        }

        Ok(report)
    }

    async fn guest_distros(&self) -> Vec<String> {
        match self.probe.list_guest_distros().await {
            Ok(distros) => distros,
            Err(error) => {
                tracing::warn!(%error, "could not list guest distributions");
                Vec::new()
            }
        }
    }
}
