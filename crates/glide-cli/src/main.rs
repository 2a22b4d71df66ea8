use std::{env, fs, path::Path, process::ExitCode};

use glide::{Config, RunError, Runner, StdPrint};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() == 1 {
        eprintln!("You must enter a source path e.g: glide \"main.gl\"");
        return ExitCode::FAILURE;
    }
    if args.len() > 2 {
        eprintln!("Interpreter only accepts 1 argument: source path");
        return ExitCode::FAILURE;
    }

    let source_path = &args[1];
    let code = match read_file(source_path) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(Path::new(".")) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: malformed glide.json: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut runner = Runner::new(code, source_path);
    let builtins_path = config.builtins_path();
    match fs::read_to_string(builtins_path) {
        Ok(source) => runner = runner.with_builtins(source, builtins_path),
        Err(err) => {
            // the compiled-in bootstrap covers the default path; a custom
            // path that cannot be read is fatal
            if builtins_path != glide::DEFAULT_BUILTINS_NAME {
                eprintln!("error: unable to read builtins '{builtins_path}': {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    match runner.run(&mut StdPrint) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Exit(code)) => ExitCode::from(code.rem_euclid(256) as u8),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn read_file(file_path: &str) -> Result<String, String> {
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{file_path} is not a file"));
            }
        }
        Err(err) => {
            return Err(format!("unable to read {file_path}: {err}"));
        }
    }
    fs::read_to_string(file_path).map_err(|err| format!("unable to read {file_path}: {err}"))
}
