/// Get environment variable with TIERWISE_ prefix, falling back to unprefixed version
///
/// Checks `TIERWISE_{key}` first, then `{key}`.
///
/// # Examples
///
/// ```rust
/// use tierwise::utils::get_env_with_prefix;
///
/// // Checks TIERWISE_DATA_DIR first, then DATA_DIR
/// let data_dir = get_env_with_prefix("DATA_DIR");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TIERWISE_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Read a comma-separated list from the environment, skipping blank entries.
pub fn get_env_list(key: &str) -> Option<Vec<String>> {
    get_env_with_prefix(key).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}
