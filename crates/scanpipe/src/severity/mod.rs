//! Module/finding-type to severity lookup.

use crate::models::Severity::{self, Critical, High, Low, Medium};

type ModuleTable = &'static [(&'static str, Severity)];

/// Severity assigned when the module or finding type is not in the table.
pub const DEFAULT_SEVERITY: Severity = Low;

static BUILTIN: &[(&str, ModuleTable)] = &[
    (
        "recon",
        &[
            ("subdomain_takeover", High),
            ("exposed_admin_panel", Medium),
            ("exposed_git_directory", High),
            ("dns_zone_transfer", Medium),
            ("header_leak", Low),
            ("email_disclosure", Low),
        ],
    ),
    (
        "web",
        &[
            ("sql_injection", Critical),
            ("command_injection", Critical),
            ("remote_code_execution", Critical),
            ("xss", High),
            ("ssrf", High),
            ("path_traversal", High),
            ("csrf", Medium),
            ("open_redirect", Medium),
            ("clickjacking", Low),
            ("directory_listing", Low),
            ("missing_security_header", Low),
        ],
    ),
    (
        "network",
        &[
            ("telnet_enabled", High),
            ("exposed_database", High),
            ("weak_ssh_config", Medium),
            ("smb_signing_disabled", Medium),
            ("open_port", Low),
        ],
    ),
    (
        "ssl",
        &[
            ("heartbleed", Critical),
            ("expired_certificate", High),
            ("self_signed_certificate", Medium),
            ("weak_cipher", Medium),
            ("deprecated_protocol", Medium),
            ("missing_hsts", Low),
        ],
    ),
    (
        "auth",
        &[
            ("default_credentials", Critical),
            ("authentication_bypass", Critical),
            ("weak_password_policy", Medium),
            ("no_rate_limiting", Medium),
            ("username_enumeration", Low),
        ],
    ),
    (
        "api",
        &[
            ("missing_authentication", Critical),
            ("broken_object_level_authorization", High),
            ("mass_assignment", High),
            ("excessive_data_exposure", Medium),
            ("verbose_errors", Low),
        ],
    ),
];

/// Immutable two-level table: module name, then finding type.
#[derive(Debug, Clone, Copy)]
pub struct SeverityTable {
    modules: &'static [(&'static str, ModuleTable)],
}

impl SeverityTable {
    pub const fn new(modules: &'static [(&'static str, ModuleTable)]) -> Self {
        Self { modules }
    }

    pub const fn builtin() -> Self {
        Self::new(BUILTIN)
    }

    pub fn classify(&self, module: &str, finding_type: &str) -> Severity {
        self.modules
            .iter()
            .find(|(name, _)| *name == module)
            .and_then(|(_, types)| types.iter().find(|(t, _)| *t == finding_type))
            .map(|(_, severity)| *severity)
            .unwrap_or(DEFAULT_SEVERITY)
    }
}

impl Default for SeverityTable {
    fn default() -> Self {
        Self::builtin()
    }
}
