//! Global template catalog.
//!
//! A template is a fixed bundle of bindings a context can opt into at
//! creation. The catalog is closed: templates are variants of
//! [`GlobalTemplate`], not runtime registrations. Selecting several
//! templates installs them in order, so a later template overwrites any
//! binding an earlier one also defines (`buffer` and `encoding` both bind
//! `atob`/`btoa`).

mod buffer;
mod console;
mod crypto;
mod encoding;
mod process;
mod timers;
mod urls;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Instant;

use rquickjs::{Ctx, Function, Value};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub(crate) use timers::TimerQueue;

/// A named capability bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalTemplate {
    /// `console` forwarding to host logging
    Console,
    /// `setTimeout` and friends, settled within the run's deadline
    Timers,
    /// Random values and hashing
    Crypto,
    /// A `Uint8Array`-based `Buffer` plus base64 helpers
    Buffer,
    /// `TextEncoder`/`TextDecoder` plus base64 helpers
    Encoding,
    /// `URL` and `URLSearchParams`
    Url,
    /// A frozen, limited `process` object
    Process,
}

impl GlobalTemplate {
    /// The whole catalog.
    pub const ALL: [GlobalTemplate; 7] = [
        GlobalTemplate::Console,
        GlobalTemplate::Timers,
        GlobalTemplate::Crypto,
        GlobalTemplate::Buffer,
        GlobalTemplate::Encoding,
        GlobalTemplate::Url,
        GlobalTemplate::Process,
    ];

    /// Template name as used in options.
    pub fn name(&self) -> &'static str {
        match self {
            GlobalTemplate::Console => "console",
            GlobalTemplate::Timers => "timers",
            GlobalTemplate::Crypto => "crypto",
            GlobalTemplate::Buffer => "buffer",
            GlobalTemplate::Encoding => "encoding",
            GlobalTemplate::Url => "url",
            GlobalTemplate::Process => "process",
        }
    }

    /// Global names this template binds.
    pub fn bindings(&self) -> &'static [&'static str] {
        match self {
            GlobalTemplate::Console => &["console"],
            GlobalTemplate::Timers => &[
                "setTimeout",
                "clearTimeout",
                "setInterval",
                "clearInterval",
                "setImmediate",
                "clearImmediate",
            ],
            GlobalTemplate::Crypto => &["crypto"],
            GlobalTemplate::Buffer => &["Buffer", "atob", "btoa"],
            GlobalTemplate::Encoding => &["TextEncoder", "TextDecoder", "atob", "btoa"],
            GlobalTemplate::Url => &["URL", "URLSearchParams"],
            GlobalTemplate::Process => &["process"],
        }
    }

    /// One-line description.
    pub fn description(&self) -> &'static str {
        match self {
            GlobalTemplate::Console => "console output forwarded to host logging",
            GlobalTemplate::Timers => "timers that fire before the run settles",
            GlobalTemplate::Crypto => "random values and SHA-2 digests",
            GlobalTemplate::Buffer => "binary buffers with utf8/hex/base64 encodings",
            GlobalTemplate::Encoding => "UTF-8 text encoding and base64 helpers",
            GlobalTemplate::Url => "WHATWG URL parsing",
            GlobalTemplate::Process => "read-only process information",
        }
    }

    pub(crate) fn install<'js>(&self, ctx: &Ctx<'js>, env: &TemplateEnv) -> rquickjs::Result<()> {
        match self {
            GlobalTemplate::Console => console::install(ctx, env),
            GlobalTemplate::Timers => timers::install(ctx, env),
            GlobalTemplate::Crypto => crypto::install(ctx),
            GlobalTemplate::Buffer => buffer::install(ctx),
            GlobalTemplate::Encoding => encoding::install(ctx),
            GlobalTemplate::Url => urls::install(ctx),
            GlobalTemplate::Process => process::install(ctx, env),
        }
    }
}

impl fmt::Display for GlobalTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GlobalTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GlobalTemplate::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| Error::context_error(format!("Unknown global template: {}", s)))
    }
}

/// Per-context state the templates close over.
#[derive(Debug, Clone)]
pub(crate) struct TemplateEnv {
    pub context_id: String,
    pub timers: Rc<RefCell<TimerQueue>>,
    pub started: Instant,
}

/// Evaluate a JS factory and call it with host functions.
///
/// Keeps host helpers out of the global namespace: they are only reachable
/// through the closure the factory returns.
fn from_factory<'js, A>(ctx: &Ctx<'js>, source: &str, args: A) -> rquickjs::Result<Value<'js>>
where
    A: rquickjs::function::IntoArgs<'js>,
{
    let factory: Function<'js> = ctx.eval(source)?;
    factory.call(args)
}

/// Shared `atob`/`btoa` for the `buffer` and `encoding` templates.
fn install_base64<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use rquickjs::{Exception, function::Rest};

    let globals = ctx.globals();

    let btoa = Function::new(ctx.clone(), |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
        let input = crate::console::format_args(&ctx, &args.0);
        // btoa only accepts Latin-1 code points.
        let bytes = input
            .chars()
            .map(|c| u8::try_from(u32::from(c)))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| {
                Exception::throw_message(&ctx, "Invalid character: string contains code points above U+00FF")
            })?;
        Ok::<_, rquickjs::Error>(STANDARD.encode(bytes))
    })?;
    globals.set("btoa", btoa)?;

    let atob = Function::new(ctx.clone(), |ctx: Ctx<'js>, input: String| {
        let cleaned: String = input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let bytes = STANDARD
            .decode(cleaned.as_bytes())
            .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(cleaned.as_bytes()))
            .map_err(|_| Exception::throw_message(&ctx, "Invalid character: not valid base64"))?;
        Ok::<_, rquickjs::Error>(bytes.into_iter().map(char::from).collect::<String>())
    })?;
    globals.set("atob", atob)?;

    Ok(())
}
