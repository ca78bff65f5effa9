//! A frozen `process` object exposing harmless host facts.
//!
//! `env` and `argv` are always empty and `cwd()` is always `/`: scripts learn
//! the platform they run on, never anything about the host's filesystem or
//! environment.

use rquickjs::{Ctx, Function};

use super::{TemplateEnv, from_factory};

const FACTORY: &str = r#"
(function (platform, arch, pid, version, engine, uptime) {
  const freeze = Object.freeze;
  return freeze({
    platform,
    arch,
    pid,
    version,
    versions: freeze({ cove: version.replace(/^v/, ""), quickjs: engine }),
    env: freeze({}),
    argv: freeze([]),
    cwd() {
      return "/";
    },
    uptime() {
      return uptime();
    },
    nextTick(callback, ...args) {
      if (typeof callback !== "function") {
        throw new TypeError("The \"callback\" argument must be of type function");
      }
      Promise.resolve().then(() => callback(...args));
    },
  });
})
"#;

/// Node's names for the host platform.
fn node_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// Node's names for the host architecture.
fn node_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    }
}

pub(super) fn install<'js>(ctx: &Ctx<'js>, env: &TemplateEnv) -> rquickjs::Result<()> {
    let started = env.started;
    let uptime = Function::new(ctx.clone(), move || started.elapsed().as_secs_f64())?;

    let process = from_factory(
        ctx,
        FACTORY,
        (
            node_platform(),
            node_arch(),
            std::process::id(),
            format!("v{}", env!("CARGO_PKG_VERSION")),
            "quickjs",
            uptime,
        ),
    )?;
    ctx.globals().set("process", process)
}
