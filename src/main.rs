use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use niobium::ast::Program;
use niobium::bytecode::{self, CodeBlock};
use niobium::runtime::builtins::Registry;
use niobium::runtime::env::Env;
use niobium::runtime::ops;
use niobium::runtime::value::Value;
use niobium::{compiler, eval, parser, vm};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let mut backend_name = "eval".to_string();
    let mut interactive = false;
    let mut print_ast = false;
    let mut compile_only = false;
    let mut output_file: Option<String> = None;
    let mut input_path: Option<String> = None;
    let mut script_args: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" | "-b" => {
                backend_name = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("Missing backend name after {arg}"))?;
            }
            "-i" => interactive = true,
            "--ast" => print_ast = true,
            "--compile" => {
                compile_only = true;
                backend_name = "vm".to_string();
            }
            "-o" => {
                output_file = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("Missing output file after -o"))?
                    .into();
            }
            "--version" => {
                println!("niobium {VERSION}");
                return Ok(());
            }
            _ => {
                input_path = Some(arg);
                script_args = args.by_ref().collect();
                break;
            }
        }
    }

    if interactive {
        println!("niobium {VERSION}");
        println!("Type .quit to exit");
        return repl();
    }

    let Some(path) = input_path else {
        bail!("No script given");
    };

    let env = root_environment(&path, &script_args)?;

    if Path::new(&path).extension().and_then(|e| e.to_str()) == Some("nib") {
        let data = std::fs::read(&path).with_context(|| format!("Reading {path}"))?;
        let code = bytecode::read_nib(&data).with_context(|| format!("Decoding {path}"))?;
        return run_code(Rc::new(code), &env);
    }

    let source = std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
    let program = match parser::parse_file(&source, &path) {
        Ok(program) => program,
        Err(errors) => {
            for error in &errors.0 {
                eprintln!("ERROR: {error}");
            }
            process::exit(1);
        }
    };

    if print_ast {
        print!("{program}");
        return Ok(());
    }

    if compile_only || output_file.is_some() {
        let code = compiler::compile_with(&program, "__main", &Registry::with_defaults())?;
        if let Some(output_file) = output_file {
            let data = bytecode::write_nib(&code);
            std::fs::write(&output_file, data).with_context(|| format!("Writing {output_file}"))?;
            return Ok(());
        }
        return run_code(Rc::new(code), &env);
    }

    run_source(&program, &backend_name, &env)
}

fn root_environment(script_path: &str, script_args: &[String]) -> Result<Env> {
    let env = Env::new();

    let mut argv = vec![Value::string(script_path)];
    argv.extend(script_args.iter().map(Value::string));
    env.create_const("_ARGV", Value::array(argv))
        .map_err(|e| anyhow::anyhow!("seeding _ARGV: {e}"))?;

    let vars = std::env::vars()
        .map(|(key, value)| (Value::string(key), Value::string(value)))
        .collect();
    let env_hash = ops::hash_from_pairs(vars)
        .map_err(|e| anyhow::anyhow!("seeding _ENV: {}", e.inspect()))?;
    env.create_const("_ENV", env_hash)
        .map_err(|e| anyhow::anyhow!("seeding _ENV: {e}"))?;

    env.create_const("_FILE", Value::string(script_path))
        .map_err(|e| anyhow::anyhow!("seeding _FILE: {e}"))?;

    Ok(env)
}

fn run_source(program: &Program, backend_name: &str, env: &Env) -> Result<()> {
    match backend_name {
        "eval" => {
            let mut evaluator = eval::Evaluator::new(
                Rc::new(Registry::with_defaults()),
                Arc::new(AtomicBool::new(false)),
            );
            let result = evaluator.eval_program(program, env);
            present(evaluator.take_output(), result)
        }
        "vm" => {
            let code = compiler::compile_with(program, "__main", &Registry::with_defaults())?;
            run_code(Rc::new(code), env)
        }
        other => bail!("Unknown backend '{other}'"),
    }
}

fn run_code(code: Rc<CodeBlock>, env: &Env) -> Result<()> {
    let mut machine = vm::Machine::new(
        Rc::new(Registry::with_defaults()),
        Arc::new(AtomicBool::new(false)),
    );
    let result = machine.execute(code, env.clone());
    present(machine.take_output(), result)
}

fn present(output: String, result: Value) -> Result<()> {
    print!("{output}");
    if let Value::Exception(exception) = &result {
        if !exception.caught {
            io::stdout().flush().ok();
            eprintln!("Uncaught exception: {}", exception.message);
            process::exit(1);
        }
    }
    if result != Value::Null {
        println!("{}", result.render());
    }
    Ok(())
}

fn repl() -> Result<()> {
    let stdin = io::stdin();
    let env = Env::new();
    let mut evaluator = eval::Evaluator::new(
        Rc::new(Registry::with_defaults()),
        Arc::new(AtomicBool::new(false)),
    );

    loop {
        print!(">> ");
        io::stdout().flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let line = line.trim_end();
        if line == ".quit" {
            return Ok(());
        }

        let program = match parser::parse(line) {
            Ok(program) => program,
            Err(errors) => {
                for error in &errors.0 {
                    eprintln!("ERROR: {error}");
                }
                continue;
            }
        };

        let result = evaluator.eval_program(&program, &env);
        print!("{}", evaluator.take_output());
        match &result {
            Value::Exception(exception) if !exception.caught => {
                eprintln!("Uncaught exception: {}", exception.message);
            }
            Value::Null => {}
            other => println!("{}", other.inspect()),
        }
    }
}
