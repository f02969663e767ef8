//! doorwatch-ctl
//!
//! One-shot commands against the access-control REST API.

use doorwatch::api::{AccessApi, HttpApi};
use doorwatch::model::{AccessLogEntry, NewUser, UserId};
use doorwatch_tools::{doorwatch_opts, init_logging, load_config, parse_opts, usage, ToolError};

use chrono::Local;
use std::env;
use std::process::ExitCode;
use tracing::debug;

const COMMANDS: &str = "<command> [args]

Commands:
    users                   list users
    add <name> <code>       create an active user
    enable <id>             enable a user
    disable <id>            disable a user
    delete <id>             delete a user
    logs [n]                latest access attempts (default 20)
    unauthorized [n]        latest unauthorized attempts (default 20)
    door                    realtime door status
    stats                   server counters
    open                    manual open of the main door";

fn print_entries(entries: &[AccessLogEntry]) {
    for e in entries {
        println!(
            "{}  {:<8} {:<20} {:<8} {:<14} {}",
            e.timestamp.with_timezone(&Local).format("%F %T"),
            if e.granted { "granted" } else { "denied" },
            e.subject(),
            e.access_code,
            e.status.as_str(),
            e.reason.as_deref().unwrap_or(""),
        );
    }
}

fn count_arg(args: &[String], index: usize) -> Result<usize, ToolError> {
    match args.get(index) {
        Some(n) => n
            .parse()
            .map_err(|_| ToolError::Usage(format!("invalid count '{}'", n))),
        None => Ok(20),
    }
}

fn arg<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str, ToolError> {
    args.get(index)
        .map(|s| s.as_str())
        .ok_or_else(|| ToolError::Usage(format!("missing {}", what)))
}

fn run(api: &dyn AccessApi, admin_name: &str, args: &[String]) -> Result<(), ToolError> {
    let command = arg(args, 0, "command")?;
    match command {
        "users" => {
            for u in api.users()? {
                println!(
                    "{:<26} {:<24} {:<10} {}",
                    u.id,
                    u.name,
                    u.access_code,
                    if u.is_active { "active" } else { "inactive" }
                );
            }
        }
        "add" => {
            let user = NewUser::new(arg(args, 1, "name")?, arg(args, 2, "access code")?);
            if !user.is_complete() {
                return Err(ToolError::Usage("name and access code are required".to_string()));
            }
            let created = api.create_user(&user)?;
            println!("created user {} ({})", created.id, created.name);
        }
        "enable" | "disable" => {
            let id = UserId::from(arg(args, 1, "user id")?);
            let user = api.set_user_active(&id, command == "enable")?;
            println!("user {} is now {}", user.id, if user.is_active { "active" } else { "inactive" });
        }
        "delete" => {
            let id = UserId::from(arg(args, 1, "user id")?);
            api.delete_user(&id)?;
            println!("deleted user {}", id);
        }
        "logs" => print_entries(&api.access_logs(count_arg(args, 1)?)?),
        "unauthorized" => print_entries(&api.unauthorized_access(count_arg(args, 1)?)?),
        "door" => {
            let door = api.door_status()?;
            println!(
                "{}: {} since {}",
                door.door_id,
                if door.is_open { "OPEN" } else { "closed" },
                door.last_event_ts.with_timezone(&Local).format("%F %T")
            );
        }
        "stats" => {
            let s = api.stats()?;
            println!("users:        {} ({} active)", s.total_users, s.active_users);
            println!("accesses:     {}", s.total_accesses);
            println!("granted:      {}", s.granted_accesses);
            println!("denied:       {}", s.denied_accesses);
            println!("unauthorized: {}", s.unauthorized_attempts);
        }
        "open" => {
            api.open_door(admin_name)?;
            println!("door opened");
        }
        other => return Err(ToolError::Usage(format!("unknown command '{}'", other))),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(|s| s.as_str()).unwrap_or("doorwatch-ctl");
    let opts = doorwatch_opts();
    let matches = match parse_opts(&opts, &args) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}\n\n{}", e, usage(&opts, program, COMMANDS));
            return ExitCode::from(2);
        }
    };
    if matches.opt_present("h") || matches.free.is_empty() {
        println!("{}", usage(&opts, program, COMMANDS));
        return ExitCode::SUCCESS;
    }
    init_logging(matches.opt_present("v"));

    let config = match load_config(&matches) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };
    let api = HttpApi::new(&config.api_url, config.request_timeout());
    debug!("{} {:?}", config.api_url, matches.free);
    match run(&api, &config.admin_name, &matches.free) {
        Ok(()) => ExitCode::SUCCESS,
        Err(ToolError::Usage(msg)) => {
            eprintln!("{}\n\n{}", msg, usage(&opts, program, COMMANDS));
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
