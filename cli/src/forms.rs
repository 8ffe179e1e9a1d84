//! Command-line arguments and the JSON payloads they become.
//!
//! ## Commands
//!
//! - `portal-submit permit --code <CODE> --name <NAME> --kind <KIND> --date <DATE>...`
//! - `portal-submit equipment --code <CODE> --name <NAME> --kind <KIND> --zone <ZONE>`
//! - `portal-submit phone --code <CODE> --phone <PHONE>`

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

/// Submit portal forms with retries, timeouts and duplicate suppression.
#[derive(Debug, Parser)]
#[command(name = "portal-submit", version)]
pub struct Cli {
    /// Config file (defaults to ./portal-submit.toml, then the user config dir).
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Output as JSON.
    #[arg(long = "json", short = 'j', global = true)]
    pub json: bool,

    /// Resubmit the same payload this many more times.
    #[arg(long = "repeat", default_value_t = 0, global = true)]
    pub repeat: u32,

    #[command(subcommand)]
    pub command: FormCommand,
}

#[derive(Debug, Subcommand)]
pub enum FormCommand {
    /// Request a permit for one or more dates.
    Permit(PermitArgs),
    /// Request equipment or a shift change.
    Equipment(EquipmentArgs),
    /// Update the phone number on file.
    Phone(PhoneArgs),
}

impl FormCommand {
    /// Flow name used to look up the retry policy.
    pub fn flow(&self) -> &'static str {
        match self {
            FormCommand::Permit(_) => "permit",
            FormCommand::Equipment(_) => "equipment",
            FormCommand::Phone(_) => "phone",
        }
    }

    /// Backend path the payload is posted to.
    pub fn endpoint(&self) -> &'static str {
        match self {
            FormCommand::Permit(_) => "/api/permit-request",
            FormCommand::Equipment(_) => "/api/equipment-request",
            FormCommand::Phone(_) => "/api/update-phone",
        }
    }
}

#[derive(Debug, Args)]
pub struct PermitArgs {
    /// Employee code.
    #[arg(long)]
    pub code: String,

    /// Employee name.
    #[arg(long)]
    pub name: String,

    /// Contact phone.
    #[arg(long)]
    pub phone: Option<String>,

    /// Novelty type (e.g. cita, audiencia, semanaAM).
    #[arg(long)]
    pub kind: String,

    /// Requested date, YYYY-MM-DD. Repeat for several dates.
    #[arg(long = "date", required = true)]
    pub dates: Vec<String>,

    /// Time of day, HH:MM.
    #[arg(long)]
    pub time: Option<String>,

    #[arg(long, default_value = "")]
    pub description: String,
}

#[derive(Debug, Args)]
pub struct EquipmentArgs {
    #[arg(long)]
    pub code: String,

    #[arg(long)]
    pub name: String,

    /// Request type (e.g. "Turno pareja", "Disponible fijo").
    #[arg(long)]
    pub kind: String,

    #[arg(long)]
    pub zone: String,

    #[arg(long, default_value = "")]
    pub description: String,
}

#[derive(Debug, Args)]
pub struct PhoneArgs {
    #[arg(long)]
    pub code: String,

    /// New phone number.
    #[arg(long)]
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitRequest {
    pub code: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub dates: Vec<String>,
    pub novelty_type: String,
    pub time: String,
    pub description: String,
}

impl From<PermitArgs> for PermitRequest {
    fn from(args: PermitArgs) -> Self {
        Self {
            code: args.code,
            name: args.name,
            phone: args.phone,
            dates: args.dates,
            novelty_type: args.kind,
            time: args.time.unwrap_or_default(),
            description: args.description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquipmentRequest {
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "zona")]
    pub zone: String,
    pub description: String,
}

impl From<EquipmentArgs> for EquipmentRequest {
    fn from(args: EquipmentArgs) -> Self {
        Self {
            code: args.code,
            name: args.name,
            kind: args.kind,
            zone: args.zone,
            description: args.description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhoneUpdate {
    pub code: String,
    pub phone: String,
}

impl From<PhoneArgs> for PhoneUpdate {
    fn from(args: PhoneArgs) -> Self {
        Self {
            code: args.code,
            phone: args.phone,
        }
    }
}
