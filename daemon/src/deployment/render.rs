use std::fmt::Write;

use crate::config::BuildConfig;

/// Container-side directory layout a rendered configuration refers to.
#[derive(Clone, Debug)]
pub struct RenderPaths {
    pub build_dir: String,
    pub downloads_dir: String,
    pub sstate_dir: String,
}

/// Render `conf/local.conf` for one build. Pure over its inputs.
pub fn local_conf(config: &BuildConfig, paths: &RenderPaths, host_cpus: u32) -> String {
    let threads = config.build.bb_threads.unwrap_or(host_cpus).min(host_cpus);
    let make_jobs = config.build.parallel_make.unwrap_or(host_cpus).min(host_cpus);

    let mut out = String::new();
    let _ = writeln!(out, "MACHINE = \"{}\"", config.machine);
    let _ = writeln!(out, "DISTRO = \"{}\"", config.distro);
    let _ = writeln!(out, "BB_NUMBER_THREADS = \"{threads}\"");
    let _ = writeln!(out, "PARALLEL_MAKE = \"-j {make_jobs}\"");
    let _ = writeln!(out, "DL_DIR = \"{}\"", paths.downloads_dir);
    let _ = writeln!(out, "SSTATE_DIR = \"{}\"", paths.sstate_dir);
    let _ = writeln!(out, "TMPDIR = \"{}/tmp\"", paths.build_dir);
    let _ = writeln!(out, "DEPLOY_DIR = \"{}/deploy\"", paths.build_dir);

    if let Some(mirrors) = &config.build.sstate_mirrors {
        let _ = writeln!(out, "SSTATE_MIRRORS = \"{mirrors}\"");
    }
    if let Some(premirrors) = &config.build.premirrors {
        let _ = writeln!(out, "PREMIRRORS:prepend = \"{premirrors}\"");
    }
    if config.build.bb_no_network {
        let _ = writeln!(out, "BB_NO_NETWORK = \"1\"");
    }

    let _ = writeln!(out, "CONF_VERSION = \"2\"");

    out
}

/// Render `conf/bblayers.conf` over the container-side layer directories.
pub fn bblayers_conf(layer_dirs: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "POKY_BBLAYERS_CONF_VERSION = \"2\"");
    let _ = writeln!(out, "BBPATH = \"${{TOPDIR}}\"");
    let _ = writeln!(out, "BBFILES ?= \"\"");
    let _ = writeln!(out, "BBLAYERS ?= \" \\");
    for dir in layer_dirs {
        let _ = writeln!(out, "  {dir} \\");
    }
    let _ = writeln!(out, "\"");

    out
}

/// Whether a `conf/layer.conf` declares compatibility with the configured
/// Yocto series. Layers that declare no `LAYERSERIES_COMPAT` are excluded:
/// BitBake would reject them anyway.
pub fn series_compatible(layer_conf: &str, series: &str) -> bool {
    layer_conf
        .lines()
        .filter(|line| line.trim_start().starts_with("LAYERSERIES_COMPAT"))
        .any(|line| {
            line.split('=')
                .nth(1)
                .map(|value| value.split_whitespace().any(|word| word.trim_matches('"') == series))
                .unwrap_or_default()
        })
}
