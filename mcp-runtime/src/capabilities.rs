//! Capability catalog and the registry that turns enabled capabilities into tools.

use std::collections::BTreeSet;

use crate::config::parse_name_list;
use crate::tools::{self, ToolRouter};

/// One named group of tools.
pub struct CapabilityDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub default_enabled: bool,
    pub register: fn(&mut ToolRouter),
}

fn register_database(router: &mut ToolRouter) {
    tools::platform::register(router, &tools::platform::DATABASE);
}

fn register_storage(router: &mut ToolRouter) {
    tools::platform::register(router, &tools::platform::STORAGE);
}

fn register_functions(router: &mut ToolRouter) {
    tools::platform::register(router, &tools::platform::FUNCTIONS);
}

fn register_hosting(router: &mut ToolRouter) {
    tools::platform::register(router, &tools::platform::HOSTING);
}

fn register_logs(router: &mut ToolRouter) {
    tools::platform::register(router, &tools::platform::LOGS);
}

/// Catalog order is registration order.
pub static CATALOG: &[CapabilityDescriptor] = &[
    CapabilityDescriptor {
        name: "env",
        description: "Inspect, list and switch the active environment",
        default_enabled: true,
        register: tools::env::register,
    },
    CapabilityDescriptor {
        name: "interactive",
        description: "Ask the user questions and confirmations on a local page",
        default_enabled: true,
        register: tools::interactive::register,
    },
    CapabilityDescriptor {
        name: "database",
        description: "Database API pass-through",
        default_enabled: true,
        register: register_database,
    },
    CapabilityDescriptor {
        name: "storage",
        description: "Object storage API pass-through",
        default_enabled: true,
        register: register_storage,
    },
    CapabilityDescriptor {
        name: "functions",
        description: "Cloud functions API pass-through",
        default_enabled: true,
        register: register_functions,
    },
    CapabilityDescriptor {
        name: "hosting",
        description: "Static hosting API pass-through",
        default_enabled: true,
        register: register_hosting,
    },
    CapabilityDescriptor {
        name: "logs",
        description: "Runtime log queries",
        default_enabled: false,
        register: register_logs,
    },
];

pub fn descriptor(name: &str) -> Option<&'static CapabilityDescriptor> {
    CATALOG.iter().find(|descriptor| descriptor.name == name)
}

/// Enabled capability names in catalog order.
///
/// An allow-list replaces the defaults (`all` selects the whole catalog);
/// the deny-list always wins. Unknown names are logged and skipped.
pub fn resolve_enabled(allow: Option<&str>, deny: Option<&str>) -> Vec<&'static str> {
    let allow = allow.map(parse_name_list).filter(|names| !names.is_empty());
    let deny: BTreeSet<String> = deny.map(parse_name_list).unwrap_or_default().into_iter().collect();

    for name in allow.iter().flatten().chain(deny.iter()) {
        if name != "all" && descriptor(name).is_none() {
            tracing::warn!(capability = %name, "unknown capability name ignored");
        }
    }

    CATALOG
        .iter()
        .filter(|descriptor| match &allow {
            Some(names) => names.iter().any(|name| name == "all" || name == descriptor.name),
            None => descriptor.default_enabled,
        })
        .filter(|descriptor| !deny.contains(descriptor.name))
        .map(|descriptor| descriptor.name)
        .collect()
}

/// Registers capabilities into a [`ToolRouter`], each at most once.
pub struct CapabilityRegistry {
    router: ToolRouter,
    registered: Vec<&'static str>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            router: ToolRouter::new(),
            registered: Vec::new(),
        }
    }

    /// Build from allow/deny lists in one sequential pass.
    pub fn from_lists(allow: Option<&str>, deny: Option<&str>) -> Self {
        let mut registry = Self::new();
        for name in resolve_enabled(allow, deny) {
            registry.register(name);
        }
        registry
    }

    /// Returns false for unknown or already registered names.
    pub fn register(&mut self, name: &str) -> bool {
        let Some(descriptor) = descriptor(name) else {
            tracing::warn!(capability = name, "unknown capability; skipping");
            return false;
        };
        if self.registered.contains(&descriptor.name) {
            return false;
        }
        let before = self.router.len();
        (descriptor.register)(&mut self.router);
        self.registered.push(descriptor.name);
        tracing::debug!(
            capability = descriptor.name,
            tools = self.router.len() - before,
            "capability registered"
        );
        true
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registered.iter().any(|registered| *registered == name)
    }

    pub fn registered(&self) -> &[&'static str] {
        &self.registered
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    pub fn into_router(self) -> ToolRouter {
        self.router
    }
}
