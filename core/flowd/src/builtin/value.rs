//! `local.value`: exports its argument.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::component::{Component, Handler, Options, RunContext};
use crate::registry::{Registration, Stability};
use crate::value::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct ValueArguments {
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueExports {
    pub value: Value,
}

pub struct ValueUnit {
    opts: Options,
}

pub(super) fn registration() -> Registration {
    Registration::new::<ValueArguments, ValueExports, _, _>("local.value", Stability::GenerallyAvailable, ValueUnit::new)
}

impl ValueUnit {
    /// Creates the unit and publishes its value right away, so that the
    /// dependents can be evaluated in the same pass.
    pub fn new(opts: Options, args: ValueArguments) -> anyhow::Result<Self> {
        let unit = Self { opts };
        unit.export(args.value);
        Ok(unit)
    }

    fn export(&self, value: Value) {
        // built by hand: the value may contain nulls, which records cannot encode
        self.opts.publish(Value::object([("value", value)]));
    }
}

impl Handler for ValueUnit {
    fn update(&mut self, args: Value) -> anyhow::Result<()> {
        let args: ValueArguments = args.decode()?;
        self.export(args.value);
        Ok(())
    }
}

impl Component for ValueUnit {
    fn run(mut self: Box<Self>, mut ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move { ctx.serve(&mut *self).await })
    }
}
