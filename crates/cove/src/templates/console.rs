//! `console` bound to host logging.

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value};

use super::TemplateEnv;
use crate::console::{ConsoleLevel, format_args};

pub(super) fn install<'js>(ctx: &Ctx<'js>, env: &TemplateEnv) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;

    for level in ConsoleLevel::ALL {
        let context_id = env.context_id.clone();
        let method = Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
            let message = format_args(&ctx, &args.0);
            match level {
                ConsoleLevel::Error => {
                    tracing::error!(target: "cove::script", context_id = %context_id, "{}", message)
                }
                ConsoleLevel::Warn => {
                    tracing::warn!(target: "cove::script", context_id = %context_id, "{}", message)
                }
                ConsoleLevel::Debug => {
                    tracing::debug!(target: "cove::script", context_id = %context_id, "{}", message)
                }
                ConsoleLevel::Log | ConsoleLevel::Info => {
                    tracing::info!(target: "cove::script", context_id = %context_id, "{}", message)
                }
            }
        })?;
        console.set(level.method(), method)?;
    }

    ctx.globals().set("console", console)
}
