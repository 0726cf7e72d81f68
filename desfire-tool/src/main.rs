use clap::Parser;

use desfire::auth;
use desfire::commands;
use desfire::context::{CommandSet, DesfireContext, SecureChannel};
use desfire::crypt::KeyType;


#[derive(Clone, Debug, Parser)]
enum Mode {
    /// List PC/SC readers.
    ListReaders,
    /// Print card version, free memory and application list.
    Info(CardOpts),
    /// List application identifiers.
    Aids(CardOpts),
    /// Read a data file.
    ReadFile(ReadFileOpts),
}

#[derive(Clone, Debug, Parser)]
struct CardOpts {
    #[arg(short, long = "reader", default_value = "0")]
    pub reader_index: usize,

    /// Key number to authenticate with.
    #[arg(short = 'n', long, default_value = "0")]
    pub key_num: u8,

    /// Key material in hex; length selects nothing, --key-type does.
    #[arg(short, long, default_value = "00000000000000000000000000000000")]
    pub key: String,

    /// Key algorithm: des, 2tdea, 3tdea or aes.
    #[arg(short = 't', long, default_value = "aes")]
    pub key_type: String,

    /// Secure channel: none, d40, ev1 or ev2.
    #[arg(short = 'c', long, default_value = "none")]
    pub channel: String,

    /// Command framing: native or niso.
    #[arg(long, default_value = "native")]
    pub command_set: String,

    /// Application to select (hex AID), card level if omitted.
    #[arg(short, long)]
    pub aid: Option<String>,
}

#[derive(Clone, Debug, Parser)]
struct ReadFileOpts {
    #[command(flatten)]
    pub card: CardOpts,

    #[arg(short, long)]
    pub file_num: u8,

    #[arg(short, long, default_value = "0")]
    pub offset: u32,

    #[arg(short, long)]
    pub length: u32,
}


fn parse_key_type(name: &str) -> KeyType {
    match name {
        "des" => KeyType::Des,
        "2tdea" => KeyType::TwoTdea,
        "3tdea" => KeyType::ThreeTdea,
        "aes" => KeyType::Aes,
        other => panic!("unknown key type {:?}", other),
    }
}

fn parse_channel(name: &str) -> SecureChannel {
    match name {
        "none" => SecureChannel::None,
        "d40" => SecureChannel::D40,
        "ev1" => SecureChannel::Ev1,
        "ev2" => SecureChannel::Ev2,
        other => panic!("unknown secure channel {:?}", other),
    }
}

fn parse_command_set(name: &str) -> CommandSet {
    match name {
        "native" => CommandSet::Native,
        "niso" => CommandSet::NativeIso,
        "iso" => CommandSet::Iso,
        other => panic!("unknown command set {:?}", other),
    }
}

fn connect(ctx: &pcsc::Context, reader_index: usize) -> pcsc::Card {
    let readers_buf_len = ctx.list_readers_len()
        .expect("failed to obtain length of buffer for PC/SC reader list");
    let mut readers_buf = vec![0u8; readers_buf_len];
    let mut readers = ctx.list_readers(&mut readers_buf)
        .expect("failed to list PC/SC readers");

    let Some(reader) = readers.nth(reader_index) else {
        panic!("no reader at index {}", reader_index)
    };
    match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
        Ok(card) => card,
        Err(e) => panic!("failed to connect to card: {}", e),
    }
}

fn open_context(pcsc_ctx: &pcsc::Context, opts: &CardOpts) -> DesfireContext {
    let card = connect(pcsc_ctx, opts.reader_index);

    let key = hex::decode(&opts.key).expect("key is not valid hex");
    let key_type = parse_key_type(&opts.key_type);
    let mut ctx = DesfireContext::new(Box::new(card), opts.key_num, key_type, &key)
        .expect("failed to build card context");
    ctx.command_set = parse_command_set(&opts.command_set);

    let aid = opts.aid.as_ref().map(|text| {
        u32::from_str_radix(text, 16).expect("AID is not valid hex")
    }).unwrap_or(0x000000);

    let channel = parse_channel(&opts.channel);
    if channel == SecureChannel::None {
        commands::select_application(&mut ctx, aid)
            .expect("failed to select application");
    } else {
        auth::select_and_authenticate(&mut ctx, channel, aid)
            .expect("failed to select and authenticate");
    }
    ctx
}


fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mode = Mode::parse();

    let pcsc_ctx = pcsc::Context::establish(pcsc::Scope::User)
        .expect("failed to establish PC/SC user context");

    match mode {
        Mode::ListReaders => {
            let readers_buf_len = pcsc_ctx.list_readers_len()
                .expect("failed to obtain length of buffer for PC/SC reader list");
            let mut readers_buf = vec![0u8; readers_buf_len];
            let readers = pcsc_ctx.list_readers(&mut readers_buf)
                .expect("failed to list PC/SC readers");
            for (i, reader) in readers.enumerate() {
                println!("{}: {:?}", i, reader);
            }
        },
        Mode::Info(opts) => {
            let mut ctx = open_context(&pcsc_ctx, &opts);
            let info = commands::fill_picc_info(&mut ctx)
                .expect("failed to gather card information");

            if let Some(version) = info.version {
                println!("hardware: vendor 0x{:02X} type 0x{:02X}.{:02X} version {}.{}",
                    version.hardware.vendor_id,
                    version.hardware.card_type, version.hardware.card_subtype,
                    version.hardware.version_major, version.hardware.version_minor);
                println!("software: version {}.{}",
                    version.software.version_major, version.software.version_minor);
                println!("uid:      {}", desfire::hex_str(&version.uid));
                println!("batch:    {} week {:02X} year {:02X}",
                    desfire::hex_str(&version.batch),
                    version.production_week, version.production_year);
            }
            if let Some(free_mem) = info.free_mem {
                println!("free mem: {} bytes", free_mem);
            }
            if let Some(key_settings) = info.key_settings {
                println!("key settings: 0x{:02X}, {} keys", key_settings.settings, key_settings.num_keys());
            }
        },
        Mode::Aids(opts) => {
            let mut ctx = open_context(&pcsc_ctx, &opts);
            let aids = commands::get_aid_list(&mut ctx)
                .expect("failed to list applications");
            for aid in aids {
                println!("{:06X}", aid);
            }
        },
        Mode::ReadFile(opts) => {
            let mut ctx = open_context(&pcsc_ctx, &opts.card);
            let data = commands::read_data(&mut ctx, opts.file_num, opts.offset, opts.length)
                .expect("failed to read file");
            println!("{}", desfire::hex_str(&data));
        },
    }
}
