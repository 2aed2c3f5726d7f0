use std::process::exit;

use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use excelsa::jvm::class::MethodId;
use excelsa::jvm::link::{bootstrap_lookup_class, ensure_initialized};
use excelsa::jvm::mem::{JavaValue, TypeKind};
use excelsa::jvm::scheduler::SchedulerResult;
use excelsa::jvm::{JavaEnv, VmOptions};
use excelsa::util::dotted_to_binary;

#[derive(Debug, Default)]
struct Options {
    classpath: Option<String>,
    heap_bytes: Option<usize>,
    verbose: bool,
    main_class: Option<String>,
    program_args: Vec<String>,
}

/// `java`-style argument parsing: flags up to the main class, everything
/// after it belongs to the program.
fn parse_args() -> Result<Options, String> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-cp" | "-classpath" | "--class-path" => {
                options.classpath = Some(
                    args.next()
                        .ok_or_else(|| format!("{} requires an argument", arg))?,
                );
            }
            "-v" | "-verbose" => options.verbose = true,
            x if x.starts_with("-Xmx") => {
                let spec = &x[4..];
                let (number, scale) = match spec.as_bytes().last() {
                    Some(b'k') | Some(b'K') => (&spec[..spec.len() - 1], 1 << 10),
                    Some(b'm') | Some(b'M') => (&spec[..spec.len() - 1], 1 << 20),
                    Some(b'g') | Some(b'G') => (&spec[..spec.len() - 1], 1 << 30),
                    _ => (spec, 1),
                };
                let number: usize =
                    number.parse().map_err(|_| format!("bad heap size {}", spec))?;
                options.heap_bytes = Some(number * scale);
            }
            x if x.starts_with('-') => return Err(format!("unknown option {}", x)),
            _ => {
                options.main_class = Some(arg);
                options.program_args.extend(args.by_ref());
            }
        }
    }

    Ok(options)
}

fn run(options: Options) -> Result<i32, String> {
    let main_class_name = options
        .main_class
        .as_deref()
        .ok_or_else(|| "no main class given".to_string())?;

    let mut env = JavaEnv::new(VmOptions {
        classpath: options.classpath.clone().unwrap_or_else(|| ".".to_string()),
        heap_bytes: options.heap_bytes.unwrap_or(1 << 26),
        preemption_us: 30_000,
    })
    .map_err(|e| format!("unable to create vm: {}", e))?;

    let tid = env.main_thread();
    let binary_name = dotted_to_binary(main_class_name);

    let main_class = bootstrap_lookup_class(&mut env, tid, &binary_name)
        .map_err(|_| describe_pending_exception(&mut env, tid))?;
    ensure_initialized(&mut env, tid, main_class)
        .map_err(|_| describe_pending_exception(&mut env, tid))?;

    let main_method: MethodId = env
        .method_lookup(main_class, "main", "([Ljava/lang/String;)V", false, false)
        .ok_or_else(|| format!("class {} has no main(String[]) method", main_class_name))?;

    // Program arguments as a String[]
    let args_array = (|| {
        let array_class = bootstrap_lookup_class(&mut env, tid, "[Ljava/lang/String;")?;
        let array = env.new_array(tid, array_class, options.program_args.len() as i32)?;
        let root = env.threads[tid as usize].handles.make(Some(array));
        for (index, arg) in options.program_args.iter().enumerate() {
            let string = env.make_string(tid, arg)?;
            let array = env.threads[tid as usize].handles.get(root).unwrap();
            env.heap.set_element(
                array,
                TypeKind::Reference,
                index,
                JavaValue::Reference(Some(string)),
            );
        }
        let array = env.threads[tid as usize].handles.get(root).unwrap();
        env.threads[tid as usize].handles.drop_handle(root);
        Ok(array)
    })()
    .map_err(|_: excelsa::jvm::Raised| describe_pending_exception(&mut env, tid))?;

    let record = env.schedule(main_method, vec![JavaValue::Reference(Some(args_array))]);

    loop {
        match env.step() {
            SchedulerResult::Done => break,
            SchedulerResult::More => {
                let idle_us = env.may_sleep_us();
                if idle_us > 0 && idle_us != u64::MAX {
                    std::thread::sleep(std::time::Duration::from_micros(idle_us.min(50_000)));
                } else if idle_us == u64::MAX {
                    return Err("deadlock: every thread is blocked indefinitely".to_string());
                }
            }
            SchedulerResult::Inval => return Err("vm entered an illegal state".to_string()),
        }
    }

    let mut status = 0;
    if let Some((_, Some(exception))) = env.record_result(record) {
        let class_name = env.class(env.heap.class_of(exception)).name.clone();
        let message = excelsa::jvm::internals::reflection::read_reference_field(
            &env,
            exception,
            "detailMessage",
        )
        .and_then(|text| env.read_string(text));

        match message {
            Some(message) => eprintln!(
                "Exception in thread \"main\" {}: {}",
                class_name.replace('/', "."),
                message
            ),
            None => eprintln!("Exception in thread \"main\" {}", class_name.replace('/', ".")),
        }
        status = 1;
    }
    env.free_execution_record(record);

    Ok(status)
}

fn describe_pending_exception(env: &mut JavaEnv, tid: u32) -> String {
    match env.threads[tid as usize].current_exception.take() {
        Some(exception) => {
            let class_name = env.class(env.heap.class_of(exception)).name.clone();
            let message = excelsa::jvm::internals::reflection::read_reference_field(
                env, exception, "detailMessage",
            )
            .and_then(|text| env.read_string(text));
            match message {
                Some(message) => format!("{}: {}", class_name.replace('/', "."), message),
                None => class_name.replace('/', "."),
            }
        }
        None => "unknown error".to_string(),
    }
}

fn main() {
    let options = match parse_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("error: {}", message);
            eprintln!("usage: excelsa [-cp <path>] [-Xmx<size>] [-verbose] <main-class> [args...]");
            exit(2);
        }
    };

    let level = if options.verbose { LevelFilter::Debug } else { LevelFilter::Warn };
    let _ = TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto);

    match run(options) {
        Ok(status) => exit(status),
        Err(message) => {
            eprintln!("error: {}", message);
            exit(1);
        }
    }
}
