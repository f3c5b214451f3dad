//! Health probe defaults and user overrides
//!
//! Engines own the probe handlers (what is checked); users may only tune the
//! timing (how often and how patiently).

use k8s_openapi::api::core::v1::{Container, HTTPGetAction, Probe, TCPSocketAction};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{DeploymentOverlay, ProbeOverride};

/// HTTP GET probe against `path` on `port`
pub fn http_get_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Raw TCP connect probe on `port`
pub fn tcp_socket_probe(port: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Overlay the explicitly set fields of `overrides` onto `probe`
///
/// Zero or unset counters never replace a default. The initial delay is the
/// exception: zero is a meaningful delay, so any set value is applied.
pub fn overlay_probe(probe: &mut Probe, overrides: Option<&ProbeOverride>) {
    let Some(o) = overrides else {
        return;
    };

    if let Some(delay) = o.initial_delay_seconds {
        probe.initial_delay_seconds = Some(delay);
    }
    if let Some(v) = positive(o.period_seconds) {
        probe.period_seconds = Some(v);
    }
    if let Some(v) = positive(o.timeout_seconds) {
        probe.timeout_seconds = Some(v);
    }
    if let Some(v) = positive(o.success_threshold) {
        probe.success_threshold = Some(v);
    }
    if let Some(v) = positive(o.failure_threshold) {
        probe.failure_threshold = Some(v);
    }
    if let Some(grace) = o.termination_grace_period_seconds.filter(|v| *v > 0) {
        probe.termination_grace_period_seconds = Some(grace);
    }
}

fn positive(value: Option<i32>) -> Option<i32> {
    value.filter(|v| *v > 0)
}

/// Startup, readiness and liveness probes of the engine container
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineProbes {
    /// Gate for slow model loading
    pub startup: Option<Probe>,
    /// Traffic admission
    pub readiness: Option<Probe>,
    /// Restart on hang
    pub liveness: Option<Probe>,
}

impl EngineProbes {
    /// Apply the user's overrides from the deployment overlay
    pub fn with_overrides(mut self, overlay: &DeploymentOverlay) -> Self {
        if let Some(p) = self.startup.as_mut() {
            overlay_probe(p, overlay.startup_probe.as_ref());
        }
        if let Some(p) = self.readiness.as_mut() {
            overlay_probe(p, overlay.readiness_probe.as_ref());
        }
        if let Some(p) = self.liveness.as_mut() {
            overlay_probe(p, overlay.liveness_probe.as_ref());
        }
        self
    }

    /// Install the probes on a container
    pub fn install(self, container: &mut Container) {
        container.startup_probe = self.startup;
        container.readiness_probe = self.readiness;
        container.liveness_probe = self.liveness;
    }

    /// Probes already present on a user-supplied container
    pub fn from_container(container: &Container) -> Self {
        Self {
            startup: container.startup_probe.clone(),
            readiness: container.readiness_probe.clone(),
            liveness: container.liveness_probe.clone(),
        }
    }
}

/// Probe timing with the given counters on top of a handler
pub(crate) fn timed(
    mut probe: Probe,
    initial_delay: Option<i32>,
    period: Option<i32>,
    timeout: Option<i32>,
    failure_threshold: Option<i32>,
) -> Probe {
    probe.initial_delay_seconds = initial_delay;
    probe.period_seconds = period;
    probe.timeout_seconds = timeout;
    probe.failure_threshold = failure_threshold;
    probe
}
