use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use eid_eac::cvc::chat::{Chat, TerminalType};
use eid_eac::der_util::oid_to_dotted;
use eid_eac::eac::config::EacConfig;
use eid_eac::iso7816::file::{read_file_with, EF_CARD_ACCESS, EF_CARD_SECURITY};
use eid_eac::pace::{self, PasswordType};
use eid_eac::security_info::SecurityInfos;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;


#[derive(Clone, Debug, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct Opts {
    /// Log more; repeat for even more.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Subcommand)]
enum Mode {
    /// Lists the PC/SC readers.
    ListReaders,

    /// Reads and decodes EF.CardAccess.
    CardAccess(ReaderOpts),

    /// Establishes PACE and reads EF.CardSecurity through the secure channel.
    Pace(PaceOpts),
}

#[derive(Args, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct ReaderOpts {
    #[arg(short, long = "reader", default_value = "0")]
    pub reader_index: usize,

    /// Request up to 65536 bytes per READ BINARY.
    #[arg(short, long)]
    pub extended_length: bool,
}

#[derive(Args, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct PaceOpts {
    #[command(flatten)]
    pub reader: ReaderOpts,

    #[arg(short = 't', long, value_enum, default_value = "can")]
    pub password_type: PasswordKind,

    /// The password; for the MRZ, the document number, date of birth and date of expiry with
    /// their check digits.
    #[arg(short, long)]
    pub password: String,

    /// The discretionary data of an authentication terminal CHAT, in hex (e.g. 0000000001).
    #[arg(short, long)]
    pub chat: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, ValueEnum)]
enum PasswordKind {
    Mrz,
    #[default]
    Can,
    Pin,
    Puk,
}
impl From<PasswordKind> for PasswordType {
    fn from(value: PasswordKind) -> Self {
        match value {
            PasswordKind::Mrz => Self::Mrz,
            PasswordKind::Can => Self::Can,
            PasswordKind::Pin => Self::Pin,
            PasswordKind::Puk => Self::Puk,
        }
    }
}


type BoxedError = Box<dyn std::error::Error>;


fn decode_hex(text: &str) -> Result<Vec<u8>, BoxedError> {
    let digits: Vec<char> = text.chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in {:?}", text).into());
    }
    digits.chunks(2)
        .map(|pair| -> Result<u8, BoxedError> {
            let high = pair[0].to_digit(16);
            let low = pair[1].to_digit(16);
            match (high, low) {
                (Some(h), Some(l)) => Ok(u8::try_from(h * 16 + l)?),
                _ => Err(format!("invalid hex digits {}{}", pair[0], pair[1]).into()),
            }
        })
        .collect()
}


fn connect(ctx: &pcsc::Context, reader_index: usize) -> Result<pcsc::Card, BoxedError> {
    let mut readers_buf = vec![0u8; ctx.list_readers_len()?];
    let mut readers = ctx.list_readers(&mut readers_buf)?;
    let reader = readers.nth(reader_index)
        .ok_or_else(|| format!("no reader at index {}", reader_index))?;
    info!("connecting to {:?}", reader);
    Ok(ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?)
}


fn print_security_infos(security_infos: &SecurityInfos) {
    for pace_info in &security_infos.pace_infos {
        println!("  PACEInfo {} v{} parameters {:?}", oid_to_dotted(&pace_info.protocol), pace_info.version, pace_info.parameter_id);
    }
    for ca_info in &security_infos.ca_infos {
        println!("  CAInfo {} v{} key {:?}", oid_to_dotted(&ca_info.protocol), ca_info.version, ca_info.key_id);
    }
    for ta_info in &security_infos.ta_infos {
        println!("  TAInfo {} v{}", oid_to_dotted(&ta_info.protocol), ta_info.version);
    }
    if !security_infos.ca_public_key_infos.is_empty() {
        println!("  {} chip authentication public key(s)", security_infos.ca_public_key_infos.len());
    }
}


fn read_card_access(opts: &ReaderOpts) -> Result<(), BoxedError> {
    let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
    let mut card = connect(&ctx, opts.reader_index)?;

    let card_access = read_file_with(&mut card, EF_CARD_ACCESS, opts.extended_length)?;
    println!("EF.CardAccess:");
    print!("{}", eid_eac::hexdump(&card_access));
    print_security_infos(&SecurityInfos::decode(&card_access)?);
    Ok(())
}


fn run_pace(opts: &PaceOpts) -> Result<(), BoxedError> {
    let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
    let mut card = connect(&ctx, opts.reader.reader_index)?;
    let config = EacConfig {
        extended_length: opts.reader.extended_length,
        ..EacConfig::default()
    };

    let card_access = read_file_with(&mut card, EF_CARD_ACCESS, config.extended_length)?;
    let security_infos = SecurityInfos::decode(&card_access)?;
    debug!("EF.CardAccess:\n{}", eid_eac::hexdump(&card_access));

    let chat = match &opts.chat {
        Some(text) => Some(Chat::new(TerminalType::AuthenticationTerminal, decode_hex(text)?)?.to_bytes()),
        None => None,
    };

    let outcome = pace::establish(
        &mut card,
        &security_infos,
        &config.accepted_pace_protocols,
        opts.password_type.into(),
        opts.password.as_bytes(),
        chat.as_deref(),
    )?;
    println!("PACE established with {}", oid_to_dotted(&outcome.protocol));
    println!("  retry counter: {}", outcome.retry_counter);
    if let Some(car) = &outcome.current_car {
        println!("  current CAR:   {}", String::from_utf8_lossy(car));
    }
    if let Some(car) = &outcome.previous_car {
        println!("  previous CAR:  {}", String::from_utf8_lossy(car));
    }
    println!("  ID_PICC:");
    print!("{}", eid_eac::hexdump(&outcome.id_picc));

    let mut channel = outcome.secure_channel(card)?;
    match read_file_with(&mut channel, EF_CARD_SECURITY, config.extended_length) {
        Ok(card_security) => {
            println!("EF.CardSecurity:");
            print!("{}", eid_eac::hexdump(&card_security));
            match SecurityInfos::decode_card_security(&card_security) {
                Ok(security_infos) => print_security_infos(&security_infos),
                Err(e) => error!("failed to decode EF.CardSecurity: {}", e),
            }
        },
        // without terminal authentication, cards may keep it to themselves
        Err(e) => error!("failed to read EF.CardSecurity: {}", e),
    }
    Ok(())
}


fn list_readers() -> Result<(), BoxedError> {
    let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
    let mut readers_buf = vec![0u8; ctx.list_readers_len()?];
    for (i, reader) in ctx.list_readers(&mut readers_buf)?.enumerate() {
        println!("{}: {:?}", i, reader);
    }
    Ok(())
}


fn main() -> ExitCode {
    let opts = Opts::parse();

    let default_level = match opts.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match &opts.mode {
        Mode::ListReaders => list_readers(),
        Mode::CardAccess(reader_opts) => read_card_access(reader_opts),
        Mode::Pace(pace_opts) => run_pace(pace_opts),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        },
    }
}
