//! Common interface implemented by both execution backends.

use anyhow::Result;

use crate::ast::Program;
use crate::runtime::value::Value;

/// Executable artifact produced by a backend `prepare` step.
///
/// Keeping compilation and execution separate lets benchmarks and tests
/// measure or validate the phases independently.
pub trait PreparedBackend {
    fn run(&self) -> Result<String>;
}

/// `prepare` translates the AST into backend-owned executable state;
/// `run` is the convenience path for one-shot execution.
pub trait Backend {
    fn name(&self) -> &'static str;
    fn prepare(&self, program: &Program) -> Result<Box<dyn PreparedBackend>>;

    fn run(&self, program: &Program) -> Result<String> {
        self.prepare(program)?.run()
    }
}

pub fn backends() -> Vec<Box<dyn Backend>> {
    vec![
        Box::new(crate::eval::Interpreter::new()),
        Box::new(crate::vm::Vm::new()),
    ]
}

/// Folds a finished run into the observable output: printed text plus the
/// final value, with uncaught exceptions surfacing as errors.
pub(crate) fn finish_run(mut output: String, result: Value) -> Result<String> {
    if let Value::Exception(exception) = &result {
        if !exception.caught {
            anyhow::bail!("Uncaught exception: {}", exception.message);
        }
    }
    if result != Value::Null {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&result.render());
        output.push('\n');
    }
    Ok(output)
}
