//! Flat `KEY=value` configuration files such as `/etc/sysconfig/irqbalance`

use crate::cpuset::CpuSet;
use crate::error::HarnessError;

pub const BANNED_CPUS_KEY: &str = "IRQBALANCE_BANNED_CPUS";

/// Return the first non-comment line starting with `key_prefix`.
///
/// Lines are trimmed before matching and the trimmed line is returned as-is.
/// An empty string means the setting is absent, which is a normal state:
/// stock configuration files ship every setting commented out.
pub fn find_setting<'a>(conf: &'a str, key_prefix: &str) -> &'a str {
    conf.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find(|line| line.starts_with(key_prefix))
        .unwrap_or("")
}

/// Split a `key=value` line and return the value.
///
/// `None` for a bare key without `=`; more than one `=` is malformed.
pub fn setting_value(line: &str) -> Result<Option<&str>, HarnessError> {
    let mut parts = line.split('=');
    let _key = parts.next();
    let value = parts.next();
    if parts.next().is_some() {
        return Err(HarnessError::MalformedConfig(format!(
            "expected a single '=' in {:?}",
            line
        )));
    }
    Ok(value)
}

/// strip one leading and one trailing double quote, independently
pub fn unquote(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}

/// Extract the banned CPU set from an irqbalance configuration blob.
pub fn parse_banned_cpus(conf: &str) -> Result<CpuSet, HarnessError> {
    let line = find_setting(conf, BANNED_CPUS_KEY);
    if line.is_empty() {
        return Ok(CpuSet::new());
    }

    let Some(value) = setting_value(line)? else {
        return Ok(CpuSet::new());
    };

    let value = unquote(value.trim());
    CpuSet::parse_auto(value).map_err(|e| {
        HarnessError::MalformedConfig(format!("failed to parse the banned CPUs: {}", e))
    })
}
