/// Gateway probe
///
/// Minimal Modbus TCP master for poking at a running gateway.
///
/// ```text
/// gateway_probe --address 127.0.0.1:5020 read-input 0 2 --float32 CDAB
/// gateway_probe --address 127.0.0.1:5020 write-register 10 1234
/// ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use voltage_gateway::codec::{decode_float32, decode_int16};
use voltage_gateway::{init_logging, Endianness, GatewayResult, ModbusClient, ModbusTcpClient};

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe a Modbus TCP gateway")]
struct Args {
    /// Gateway address
    #[arg(short, long, default_value = "127.0.0.1:502")]
    address: String,

    #[arg(short, long, default_value_t = 1)]
    unit_id: u8,

    /// Response timeout in milliseconds
    #[arg(long, default_value_t = voltage_gateway::DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Hex-dump request and response frames
    #[arg(long)]
    packet_logging: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read coils (0x01)
    ReadCoils { address: u16, quantity: u16 },
    /// Read discrete inputs (0x02)
    ReadDiscrete { address: u16, quantity: u16 },
    /// Read holding registers (0x03)
    ReadHolding {
        address: u16,
        quantity: u16,
        /// Decode register pairs as Float32 with this byte order
        #[arg(long)]
        float32: Option<Endianness>,
    },
    /// Read input registers (0x04)
    ReadInput {
        address: u16,
        quantity: u16,
        /// Decode register pairs as Float32 with this byte order
        #[arg(long)]
        float32: Option<Endianness>,
    },
    /// Write a single coil (0x05)
    WriteCoil {
        address: u16,
        #[arg(action = clap::ArgAction::Set)]
        value: bool,
    },
    /// Write a single register (0x06)
    WriteRegister { address: u16, value: u16 },
    /// Write several coils (0x0F)
    WriteCoils { address: u16, values: Vec<bool> },
    /// Write several registers (0x10)
    WriteRegisters { address: u16, values: Vec<u16> },
}

fn print_bits(address: u16, bits: &[bool]) {
    for (offset, bit) in bits.iter().enumerate() {
        println!("{:>5}: {}", address as usize + offset, if *bit { "ON" } else { "OFF" });
    }
}

fn print_registers(address: u16, registers: &[u16], float32: Option<Endianness>) {
    match float32 {
        Some(endianness) => {
            for (index, pair) in registers.chunks(2).enumerate() {
                let start = address as usize + index * 2;
                match pair {
                    [high, low] => println!(
                        "{:>5}: 0x{:04X} 0x{:04X} = {}",
                        start,
                        high,
                        low,
                        decode_float32([*high, *low], endianness)
                    ),
                    [single] => println!("{:>5}: 0x{:04X} (incomplete pair)", start, single),
                    _ => {}
                }
            }
        }
        None => {
            for (offset, register) in registers.iter().enumerate() {
                println!(
                    "{:>5}: 0x{:04X} = {} / {}",
                    address as usize + offset,
                    register,
                    register,
                    decode_int16(*register)
                );
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(if args.packet_logging { LevelFilter::Debug } else { LevelFilter::Warn });

    if let Err(e) = run(args).await {
        if e.is_protocol_error() {
            eprintln!("❌ Gateway answered with an error: {}", e);
        } else {
            eprintln!("❌ Request failed: {}", e);
        }
        std::process::exit(1);
    }
}

async fn run(args: Args) -> GatewayResult<()> {
    let mut client = ModbusTcpClient::from_address(&args.address, Duration::from_millis(args.timeout_ms)).await?;
    client.set_packet_logging(args.packet_logging);
    let unit = args.unit_id;

    match args.command {
        Command::ReadCoils { address, quantity } => {
            let bits = client.read_01(unit, address, quantity).await?;
            print_bits(address, &bits);
        }
        Command::ReadDiscrete { address, quantity } => {
            let bits = client.read_02(unit, address, quantity).await?;
            print_bits(address, &bits);
        }
        Command::ReadHolding { address, quantity, float32 } => {
            let registers = client.read_03(unit, address, quantity).await?;
            print_registers(address, &registers, float32);
        }
        Command::ReadInput { address, quantity, float32 } => {
            let registers = client.read_04(unit, address, quantity).await?;
            print_registers(address, &registers, float32);
        }
        Command::WriteCoil { address, value } => {
            client.write_05(unit, address, value).await?;
            println!("✅ coil {} = {}", address, value);
        }
        Command::WriteRegister { address, value } => {
            client.write_06(unit, address, value).await?;
            println!("✅ register {} = {}", address, value);
        }
        Command::WriteCoils { address, values } => {
            client.write_0f(unit, address, &values).await?;
            println!("✅ {} coils written from {}", values.len(), address);
        }
        Command::WriteRegisters { address, values } => {
            client.write_10(unit, address, &values).await?;
            println!("✅ {} registers written from {}", values.len(), address);
        }
    }

    let stats = client.get_stats();
    log::debug!("{} requests, {} bytes sent, {} bytes received", stats.requests_sent, stats.bytes_sent, stats.bytes_received);
    client.close().await?;
    Ok(())
}
