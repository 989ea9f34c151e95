//! Unique logical name allocation

/// Return `preferred` if free, otherwise the first free `preferred-N`
/// for N = 1, 2, ...
///
/// Each probe replaces the suffix of the previous one instead of appending
/// to it.
pub fn allocate(preferred: &str, is_taken: impl Fn(&str) -> bool) -> String {
    if !is_taken(preferred) {
        return preferred.to_string();
    }

    let mut suffix: u64 = 1;
    loop {
        let candidate = format!("{preferred}-{suffix}");
        if !is_taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}
