//! `local.log`: logs its message every time it changes.

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::component::{Component, Handler, Options, RunContext};
use crate::registry::{Registration, Stability};
use crate::value::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct LogArguments {
    pub message: String,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    String::from("info")
}

pub struct LogUnit {
    opts: Options,
    level: log::Level,
    message: String,
    updates: u64,
}

pub(super) fn registration() -> Registration {
    Registration::new::<LogArguments, (), _, _>("local.log", Stability::PublicPreview, LogUnit::new)
}

impl LogUnit {
    pub fn new(opts: Options, args: LogArguments) -> anyhow::Result<Self> {
        let mut unit = Self {
            opts,
            level: log::Level::Info,
            message: String::new(),
            updates: 0,
        };
        unit.apply(args)?;
        Ok(unit)
    }

    fn apply(&mut self, args: LogArguments) -> anyhow::Result<()> {
        self.level = args
            .level
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid log level {:?}", args.level))?;
        self.message = args.message;
        log::log!(target: &self.opts.log_target, self.level, "{}", self.message);
        Ok(())
    }
}

impl Handler for LogUnit {
    fn update(&mut self, args: Value) -> anyhow::Result<()> {
        self.apply(args.decode()?)?;
        self.updates += 1;
        Ok(())
    }

    fn debug_info(&self) -> Option<Value> {
        let updates = i64::try_from(self.updates).unwrap_or(i64::MAX);
        Some(Value::object([
            ("updates", Value::Int(updates)),
            ("message", Value::from(self.message.as_str())),
        ]))
    }
}

impl Component for LogUnit {
    fn run(mut self: Box<Self>, mut ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move { ctx.serve(&mut *self).await })
    }
}
