//! `local.ticker`: counts the ticks of a timer.

use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::component::{Component, Handler, Health, Options, RunContext};
use crate::registry::{Registration, Stability};
use crate::value::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct TickerArguments {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickerExports {
    pub count: i64,
}

pub struct TickerUnit {
    opts: Options,
    interval: Duration,
    count: i64,
    last_tick: Option<SystemTime>,
}

pub(super) fn registration() -> Registration {
    Registration::new::<TickerArguments, TickerExports, _, _>("local.ticker", Stability::Experimental, TickerUnit::new)
}

impl TickerUnit {
    pub fn new(opts: Options, args: TickerArguments) -> anyhow::Result<Self> {
        anyhow::ensure!(!args.interval.is_zero(), "the interval must not be zero");
        Ok(Self {
            opts,
            interval: args.interval,
            count: 0,
            last_tick: None,
        })
    }

    fn tick(&mut self) -> anyhow::Result<()> {
        self.count += 1;
        self.last_tick = Some(SystemTime::now());
        self.opts.publish_record(&TickerExports { count: self.count })
    }
}

fn new_timer(period: Duration, start: Instant) -> Interval {
    let mut timer = tokio::time::interval_at(start, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

impl Handler for TickerUnit {
    fn update(&mut self, args: Value) -> anyhow::Result<()> {
        let args: TickerArguments = args.decode()?;
        anyhow::ensure!(!args.interval.is_zero(), "the interval must not be zero");
        self.interval = args.interval;
        Ok(())
    }

    fn health(&self) -> Option<Health> {
        let message = match self.last_tick {
            Some(t) => format!("{} ticks, last one at {}", self.count, humantime::format_rfc3339_seconds(t)),
            None => String::from("waiting for the first tick"),
        };
        Some(Health::healthy(message))
    }
}

impl Component for TickerUnit {
    fn run(mut self: Box<Self>, mut ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            let mut timer = new_timer(self.interval, Instant::now());
            loop {
                tokio::select! {
                    _ = timer.tick() => self.tick()?,
                    req = ctx.next_request() => {
                        let Some(req) = req else { break };
                        let period = self.interval;
                        req.handle(&mut *self);
                        if self.interval != period {
                            log::debug!(target: &self.opts.log_target, "new interval: {:?}", self.interval);
                            timer = new_timer(self.interval, Instant::now() + self.interval);
                        }
                    }
                }
            }
            Ok(())
        })
    }
}
