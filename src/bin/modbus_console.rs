//! Interactive Modbus master console.
//!
//! Pick a transport, then type frames in hexadecimal (slave address first,
//! no CRC or MBAP header). Each frame is sent and the request and response
//! are printed. An empty line quits.

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use a3ot_modbus_master::{ModbusMaster, RtuMaster, TcpMaster};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Transport {
    /// Serial line, Modbus RTU
    Rtu,
    /// TCP socket, Modbus TCP
    Tcp,
}

#[derive(Parser, Debug)]
#[command(name = "modbus-console", about = "Send raw Modbus frames over RTU or TCP")]
struct Cli {
    /// Transport to use; asked interactively when omitted
    #[arg(short, long, value_enum)]
    transport: Option<Transport>,

    /// Serial port name (RTU), e.g. /dev/ttyUSB0 or COM3
    #[arg(short, long)]
    serial: Option<String>,

    /// Server IP address (TCP)
    #[arg(long)]
    host: Option<String>,

    /// Server port (TCP)
    #[arg(long, default_value_t = 502)]
    port: u16,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn", env = "MODBUS_LOG_LEVEL")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let stdin = io::stdin();
    let mut input = stdin.lock();

    let master = match open_master(&cli, &mut input) {
        Ok(master) => master,
        Err(err) => {
            println!("{}", error_chain(err.as_ref()));
            return ExitCode::FAILURE;
        }
    };

    loop {
        let line = match prompt(&mut input, "Hex frame: ") {
            Ok(line) => line,
            Err(err) => {
                println!("{}", error_chain(&err));
                return ExitCode::FAILURE;
            }
        };
        if line.is_empty() {
            break;
        }
        communicate(master.as_ref(), &line);
    }
    ExitCode::SUCCESS
}

fn open_master(cli: &Cli, input: &mut impl BufRead) -> Result<Box<dyn ModbusMaster>, Box<dyn Error>> {
    let transport = match cli.transport {
        Some(transport) => transport,
        None => loop {
            match prompt(input, "Serial line or TCP? [s/t]: ")?.as_str() {
                "s" => break Transport::Rtu,
                "t" => break Transport::Tcp,
                "" => return Err("no transport selected".into()),
                _ => println!("Type s or t"),
            }
        },
    };

    match transport {
        Transport::Rtu => {
            let port_name = match &cli.serial {
                Some(name) => name.clone(),
                None => {
                    let names: Vec<String> = serialport::available_ports()
                        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
                        .unwrap_or_default();
                    println!("Serial ports found: {}", names.join(", "));
                    prompt(input, "Port to use: ")?
                }
            };
            Ok(Box::new(RtuMaster::open_port(&port_name)?))
        }
        Transport::Tcp => {
            let host = match &cli.host {
                Some(host) => host.clone(),
                None => prompt(input, "Server IP address: ")?,
            };
            Ok(Box::new(TcpMaster::open(&host, cli.port)?))
        }
    }
}

fn communicate(master: &dyn ModbusMaster, frame: &str) {
    if let Err(err) = master.send_request(frame) {
        println!("Modbus error: {}", error_chain(&err));
    }

    if let Some(request) = master.read_request() {
        println!("Request : {request}");
    }
    match master.read_response() {
        Some(response) => println!("Response: {response}"),
        None => println!("No response."),
    }
}

fn prompt(input: &mut impl BufRead, message: &str) -> io::Result<String> {
    print!("{message}");
    io::stdout().flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn error_chain(err: &dyn Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(" / ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
