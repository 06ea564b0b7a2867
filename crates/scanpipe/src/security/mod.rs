use std::{net::IpAddr, str::FromStr};

use ipnet::IpNet;

/// Whether `target` may be scanned. An empty allowlist permits everything.
pub fn in_scope(target: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }

    let host = host_of(target);
    if allowlist.iter().any(|item| {
        item.eq_ignore_ascii_case(host)
            || item
                .strip_prefix("*.")
                .is_some_and(|domain| is_subdomain(host, domain))
    }) {
        return true;
    }

    if let Ok(ip) = IpAddr::from_str(host) {
        return allowlist.iter().any(|entry| {
            IpNet::from_str(entry)
                .map(|net| net.contains(&ip))
                .unwrap_or(false)
        });
    }

    false
}

/// Strips a URL scheme, path and port so `https://api.example.com:8443/x` checks as `api.example.com`.
fn host_of(target: &str) -> &str {
    let rest = target.split_once("://").map_or(target, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    if let Some(v6) = authority.strip_prefix('[') {
        return v6.split(']').next().unwrap_or(v6);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

fn is_subdomain(host: &str, domain: &str) -> bool {
    let Some(split) = host.len().checked_sub(domain.len() + 1) else {
        return false;
    };
    host.as_bytes()[split] == b'.'
        && host
            .get(split + 1..)
            .is_some_and(|suffix| suffix.eq_ignore_ascii_case(domain))
}

/// Targets become a positional argument of the worker; reject anything that could read as a flag.
pub fn validate_target(target: &str) -> Result<(), String> {
    if target.is_empty() {
        return Err("target must not be empty".to_string());
    }
    if target.len() > 2048 {
        return Err("target is too long".to_string());
    }
    if target.starts_with('-') {
        return Err("target must not start with '-'".to_string());
    }
    if target.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("target must not contain whitespace".to_string());
    }
    Ok(())
}

pub fn validate_module(name: &str) -> Result<(), String> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !name.starts_with('-')
    {
        Ok(())
    } else {
        Err(format!("invalid module name `{name}`"))
    }
}
