// Ordered interceptor chain: each stage forwards or absorbs
use serde_json::Value;

use crate::adapter::Interception;
use crate::error::AdapterError;

/// One pipeline stage. `C` is the session state the stage may read and
/// update (pending topics, login flag).
pub trait Interceptor<C>: Send {
    fn name(&self) -> &'static str;

    fn intercept(&mut self, msg: Value, ctx: &mut C) -> Result<Interception, AdapterError>;
}

/// Closure-backed stage.
pub struct FnInterceptor<F> {
    name: &'static str,
    f: F,
}

impl<F> FnInterceptor<F> {
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<C, F> Interceptor<C> for FnInterceptor<F>
where
    F: FnMut(Value, &mut C) -> Result<Interception, AdapterError> + Send,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn intercept(&mut self, msg: Value, ctx: &mut C) -> Result<Interception, AdapterError> {
        (self.f)(msg, ctx)
    }
}

/// Append-only: stages are never removed or reordered once installed, so a
/// later stage only ever sees what every earlier stage forwarded.
pub struct Pipeline<C> {
    stages: Vec<Box<dyn Interceptor<C>>>,
}

impl<C> Default for Pipeline<C> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<C> Pipeline<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, stage: impl Interceptor<C> + 'static) {
        self.stages.push(Box::new(stage));
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs `msg` through every stage in install order. The first stage that
    /// absorbs ends processing; errors abort immediately.
    pub fn process(&mut self, msg: Value, ctx: &mut C) -> Result<Interception, AdapterError> {
        let mut msg = msg;
        for stage in self.stages.iter_mut() {
            match stage.intercept(msg, ctx)? {
                Interception::Forward(next) => msg = next,
                Interception::Absorbed => {
                    metrics::counter!("uxws_messages_absorbed_total", "stage" => stage.name())
                        .increment(1);
                    return Ok(Interception::Absorbed);
                }
            }
        }
        Ok(Interception::Forward(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Seen {
        log: Vec<(&'static str, Value)>,
    }

    type Outcome = Result<Interception, AdapterError>;

    fn recorder(
        name: &'static str,
        absorb: &'static str,
    ) -> FnInterceptor<impl FnMut(Value, &mut Seen) -> Outcome + Send> {
        FnInterceptor::new(name, move |msg: Value, seen: &mut Seen| -> Outcome {
            seen.log.push((name, msg.clone()));
            if msg["kind"] == absorb {
                Ok(Interception::Absorbed)
            } else {
                Ok(Interception::Forward(msg))
            }
        })
    }

    #[test]
    fn later_stage_never_sees_absorbed_message() {
        let mut pipeline = Pipeline::new();
        pipeline.install(recorder("first", "ack"));
        pipeline.install(recorder("second", "pong"));
        let mut seen = Seen::default();

        let out = pipeline.process(json!({"kind": "ack"}), &mut seen).unwrap();
        assert_eq!(out, Interception::Absorbed);
        assert_eq!(seen.log.len(), 1);
        assert_eq!(seen.log[0].0, "first");

        let out = pipeline.process(json!({"kind": "pong"}), &mut seen).unwrap();
        assert_eq!(out, Interception::Absorbed);
        let names: Vec<_> = seen.log.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["first", "first", "second"]);

        let data = json!({"kind": "data"});
        assert_eq!(pipeline.process(data.clone(), &mut seen).unwrap(), Interception::Forward(data));
        assert_eq!(pipeline.stage_names(), vec!["first", "second"]);
    }

    #[test]
    fn stages_may_rewrite_messages() {
        let mut pipeline: Pipeline<()> = Pipeline::new();
        pipeline.install(FnInterceptor::new("unwrap", |msg: Value, _: &mut ()| -> Outcome {
            Ok(Interception::Forward(msg.get("data").cloned().unwrap_or(msg)))
        }));
        pipeline.install(FnInterceptor::new("check", |msg: Value, _: &mut ()| -> Outcome {
            assert_eq!(msg, json!({"px": 1}));
            Ok(Interception::Forward(msg))
        }));
        let out = pipeline.process(json!({"data": {"px": 1}}), &mut ()).unwrap();
        assert_eq!(out, Interception::Forward(json!({"px": 1})));
    }

    #[test]
    fn error_stops_the_chain() {
        let mut pipeline = Pipeline::new();
        pipeline.install(FnInterceptor::new("error", |msg: Value, _: &mut Seen| -> Outcome {
            Err(AdapterError::Protocol(msg.to_string()))
        }));
        pipeline.install(recorder("after", "-"));
        let mut seen = Seen::default();
        assert!(pipeline.process(json!({"type": "error"}), &mut seen).is_err());
        assert!(seen.log.is_empty());
    }

    #[test]
    fn empty_pipeline_forwards() {
        let mut pipeline: Pipeline<()> = Pipeline::new();
        assert!(pipeline.is_empty());
        let msg = json!("pong");
        assert_eq!(pipeline.process(msg.clone(), &mut ()).unwrap(), Interception::Forward(msg));
    }
}
