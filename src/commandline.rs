use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[derive(Parser, Debug)]
#[command(version, about = "VE.Bus ESS controller and serial-to-MQTT bridges")]
pub struct Args {
    /// Path to the INI configuration file
    #[arg(long, default_value_t = String::from("config.ini"))]
    pub config: String,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Run the setpoint regulator against the inverter
    Controller,
    /// Decode the smart meter stream and publish readings
    Smartmeter,
    /// Decode the VE.Direct MPPT stream and publish records
    Mppt,
    /// Read a diagnostic dump from the inverter and print it
    FetchData {
        /// Also publish the dump to the configured fetch data topic
        #[arg(long)]
        publish: bool,
    },
}
