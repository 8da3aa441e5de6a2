use clap::Parser as ClapParser;
use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use hostbridge::{
    AsyncScope, ClassBuilder, Context, ContextCreateInfo, Error, Result,
    engine::{EngineCreateInfo, Env},
    register_module,
};
use parking_lot::RwLock;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Threads posting work to the script thread
    #[arg(long, default_value_t = 4, help = "Number of worker threads")]
    workers: usize,

    #[arg(long, default_value_t = 16, help = "Work items posted per worker")]
    items: usize,

    /// Dispatch queue backlog
    #[arg(long, help = "Dispatch queue size, 0 for unbounded")]
    queue_size: Option<usize>,
}

#[derive(Default)]
struct Point {
    x: RwLock<f64>,
    y: RwLock<f64>,
}

fn define_point(cx: &Context) -> Result<()> {
    let class = ClassBuilder::<Point>::new("Point")
        .constructor(|_| Ok(Point::default()))
        .property(
            "x",
            |args, point| args.context().number(*point.x.read()),
            |_, point, value| {
                *point.x.write() = value.to_f64()?;
                Ok(())
            },
        )
        .property(
            "y",
            |args, point| args.context().number(*point.y.read()),
            |_, point, value| {
                *point.y.write() = value.to_f64()?;
                Ok(())
            },
        )
        .define(cx)?;
    cx.global()?.set_named("Point", &class)
}

fn point_sum(cx: &Context) -> Result<f64> {
    let class = cx.import("Point", None)?;
    let point = class.construct(&[])?;
    point.set_named("x", &cx.number(3.0)?)?;
    point.set_named("y", &cx.number(4.0)?)?;
    Ok(point.get_named("x")?.to_f64()? + point.get_named("y")?.to_f64()?)
}

fn dispatch(env: &Env, cx: &Context, workers: usize, items: usize) -> Result<usize> {
    let received = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let scope = AsyncScope::open(cx)?;
        let received = received.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{worker}"))
            .spawn(move || {
                let Some(sync) = scope.sync_context() else {
                    return;
                };
                for item in 0..items {
                    let received = received.clone();
                    let posted = sync.post(move |cx| {
                        log::trace!("worker {worker} item {item}");
                        cx.int32(item as i32)?;
                        received.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    if let Err(error) = posted {
                        log::error!("worker {worker} stopped: {error}");
                        return;
                    }
                }
                drop(scope);
            })
            .map_err(|error| Error::host(format!("failed to spawn worker: {error}")))?;
        handles.push(handle);
    }

    env.run();
    for handle in handles {
        if handle.join().is_err() {
            log::error!("a worker panicked");
        }
    }
    Ok(received.load(Ordering::SeqCst))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let env = Env::new(EngineCreateInfo::default());
    let exports = match env.create_object() {
        Ok(exports) => exports,
        Err(status) => {
            eprintln!("Error creating exports: {}", status.message());
            process::exit(1);
        }
    };

    let mut context = None;
    register_module(
        &env,
        exports,
        ContextCreateInfo {
            dispatch_queue_size: cli.queue_size,
            ..Default::default()
        },
        |cx, exports| {
            define_point(cx)?;
            context = Some(cx.clone());
            Ok(exports.clone())
        },
    );
    let Some(cx) = context else {
        eprintln!("Error: module registration failed");
        process::exit(1);
    };

    match cx.scope(point_sum) {
        Ok(sum) => println!("point x + y = {sum}"),
        Err(error) => {
            eprintln!("Error: {error}");
            process::exit(1);
        }
    }

    match dispatch(&env, &cx, cli.workers, cli.items) {
        Ok(count) => println!("{count} work items ran on the script thread"),
        Err(error) => {
            eprintln!("Error: {error}");
            process::exit(1);
        }
    }

    env.shutdown();
}
