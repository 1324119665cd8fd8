use once_cell::sync::Lazy;
use regex::Regex;

/// Forwarding policy for raw BitBake output, applied between the container
/// streams and subscriber fanout. First match wins; the default is to drop.
/// File sinks always receive the unfiltered line.
pub fn should_forward(line: &str) -> bool {
    if line.contains("ERROR")
        || line.contains("FAILED")
        || line.contains("WARNING")
        || line.contains("WARN")
    {
        return true;
    }

    if line.starts_with("Summary:")
        || line.starts_with("NOTE: Tasks Summary:")
        || line.contains("Build completed")
        || line.contains("succeeded.")
    {
        return true;
    }

    if line.starts_with("NOTE: Running task") || line.starts_with("NOTE: Running setscene task") {
        return true;
    }

    if line.starts_with("NOTE: recipe")
        || line.starts_with("NOTE: Reconnecting")
        || line.starts_with("NOTE: No reply")
        || line.starts_with("NOTE: Retrying")
    {
        return false;
    }

    // Shell trace lines (+, ++, +++).
    if line.starts_with('+') {
        return false;
    }

    if line.contains("Bitbake still alive") {
        return false;
    }

    false
}

/// Structured record emitted for task-progress lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
    pub task: Option<String>,
}

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^NOTE: Running (setscene )?task (\d+) of (\d+)(\s*\((.*)\))?")
        .expect("progress pattern is valid")
});

pub fn parse_progress(line: &str) -> Option<Progress> {
    let captures = PROGRESS_RE.captures(line)?;

    Some(Progress {
        current: captures.get(2)?.as_str().parse().ok()?,
        total: captures.get(3)?.as_str().parse().ok()?,
        task: captures.get(5).map(|m| m.as_str().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_errors_and_warnings() {
        assert!(should_forward("ERROR: Task (/layers/meta/recipes/strace_5.16.bb:do_package) failed"));
        assert!(should_forward("WARNING: qemux86-64 overrides unused"));
        assert!(should_forward("WARN: something minor"));
        assert!(should_forward("NOTE: Tasks Summary: Attempted 4302 tasks of which 12 didn't need to be rerun and all succeeded."));
        assert!(should_forward("Summary: There was 1 WARNING message shown."));
        assert!(should_forward("Build completed successfully"));
    }

    #[test]
    fn forwards_task_progress() {
        assert!(should_forward("NOTE: Running task 117 of 4302 (/layers/poky/meta/recipes-devtools/gcc/gcc_13.2.bb:do_fetch)"));
        assert!(should_forward("NOTE: Running setscene task 5 of 600"));
    }

    #[test]
    fn drops_noise() {
        assert!(!should_forward("NOTE: recipe busybox-1.36.1-r0: task do_compile: Started"));
        assert!(!should_forward("NOTE: Reconnecting to bitbake server..."));
        assert!(!should_forward("NOTE: No reply from server in 30s"));
        assert!(!should_forward("NOTE: Retrying server connection (#1)..."));
        assert!(!should_forward("+ cd /home/builder/build"));
        assert!(!should_forward("++ dirname /home/builder/layers/poky/oe-init-build-env"));
        assert!(!should_forward("Bitbake still alive (5000s)"));
        assert!(!should_forward("Loading cache: 100%"));
        assert!(!should_forward(""));
    }

    #[test]
    fn parses_progress_with_descriptor() {
        let progress = parse_progress(
            "NOTE: Running task 117 of 4302 (/layers/poky/meta/recipes-devtools/gcc/gcc_13.2.bb:do_fetch)",
        )
        .unwrap();
        assert_eq!(progress.current, 117);
        assert_eq!(progress.total, 4302);
        assert_eq!(
            progress.task.as_deref(),
            Some("/layers/poky/meta/recipes-devtools/gcc/gcc_13.2.bb:do_fetch")
        );
    }

    #[test]
    fn parses_setscene_progress_without_descriptor() {
        let progress = parse_progress("NOTE: Running setscene task 5 of 600").unwrap();
        assert_eq!(progress.current, 5);
        assert_eq!(progress.total, 600);
        assert_eq!(progress.task, None);
    }

    #[test]
    fn ignores_non_progress_lines() {
        assert_eq!(parse_progress("NOTE: Executing Tasks"), None);
        assert_eq!(parse_progress("Running task 1 of 2"), None);
    }
}
