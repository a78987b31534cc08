// Outbound project filter enforcement: exclude always wins over include;
// matching is by project equality or basename suffix.

/// `true` if `project` passes the peer's effective include/exclude lists.
/// An empty `include` list means "all projects pass unless excluded".
pub fn passes(project: Option<&str>, include: &[String], exclude: &[String]) -> bool {
    let Some(project) = project else {
        return include.is_empty();
    };

    if exclude.iter().any(|p| matches(project, p)) {
        return false;
    }

    include.is_empty() || include.iter().any(|p| matches(project, p))
}

fn matches(project: &str, pattern: &str) -> bool {
    project == pattern || project.ends_with(&format!("/{pattern}"))
}
