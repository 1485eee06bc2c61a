use std::collections::BTreeSet;

use chrono::Duration;
use models::resource::Role;

/// Recognized configuration options. Constructed once
/// by the caller and passed by reference into the factory; the core does no
/// file/env parsing of its own.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mesos_role: Option<String>,
    pub mesos_authentication_principal: Option<String>,
    pub default_accepted_resource_roles: BTreeSet<Role>,
    pub env_vars_prefix: Option<String>,
    pub task_reservation_timeout: Duration,

    /// Whether a pod's per-task
    /// `LaunchedEphemeral` records carry their own `host_ports`, or leave
    /// that solely to the `LaunchGroup` operation's combined list.
    pub pod_tasks_carry_host_ports: bool,

    /// Whether a freshly derived
    /// `InstanceStatus` forces `last_updated == last_changed`.
    pub last_updated_equals_last_changed: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut default_roles = BTreeSet::new();
        default_roles.insert("*".to_string());

        Self {
            mesos_role: None,
            mesos_authentication_principal: None,
            default_accepted_resource_roles: default_roles,
            env_vars_prefix: None,
            task_reservation_timeout: Duration::hours(1),
            pod_tasks_carry_host_ports: false,
            last_updated_equals_last_changed: true,
        }
    }
}

impl SchedulerConfig {
    /// The roles a run spec actually accepts: its own declared set, or the
    /// configured defaults when it declares none.
    pub fn effective_accepted_roles<'a>(&'a self, declared: &'a BTreeSet<Role>) -> &'a BTreeSet<Role> {
        if declared.is_empty() {
            &self.default_accepted_resource_roles
        } else {
            declared
        }
    }
}
