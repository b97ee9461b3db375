use clap::*;
use clap_num::maybe_hex;
use exhume_vdisk::ldm::Database;
use exhume_vdisk::locator::{FileAccess, FileLocator, FileMode, FileShare, HostFileLocator};
use exhume_vdisk::ntfs::{AttributeRecord, FileRecordReference, NtfsAttribute};
use exhume_vdisk::vmdk::DescriptorFile;
use log::{error, info, LevelFilter};
use std::io::{Read, Seek, SeekFrom};

fn dump_descriptor(file_path: &str, json: bool) {
    info!("Processing '{}' as a VMDK descriptor file...", file_path);
    let (dir, name) = split_path(file_path);
    let locator = HostFileLocator::new(dir);

    let descriptor = match DescriptorFile::load(&locator, name) {
        Ok(descriptor) => descriptor,
        Err(err) => {
            error!("Could not parse the descriptor file: {}", err);
            std::process::exit(1);
        }
    };

    if json {
        match serde_json::to_string_pretty(&descriptor) {
            Ok(text) => println!("{}", text),
            Err(err) => error!("Could not serialize the descriptor: {}", err),
        }
        return;
    }

    info!("------------------------------------------------------------");
    match descriptor.create_type() {
        Ok(create_type) => info!("Disk Type: {:?}", create_type),
        Err(err) => info!("Disk Type: {}", err),
    }
    if let Ok(cid) = descriptor.content_id() {
        info!("Content Id: {:08x}", cid);
    }
    if let Ok(adapter) = descriptor.adapter_type() {
        info!("Adapter: {:?}", adapter);
    }
    info!("Extent list:");
    for extent in &descriptor.extents {
        info!(
            "  - {} ({} sectors, {:?}, type {})",
            extent.filename, extent.size_sectors, extent.access, extent.extent_type
        );
    }
    info!("------------------------------------------------------------");
}

fn dump_ldm(file_path: &str, offset: u64, json: bool) {
    info!(
        "Reading the LDM database of '{}' at offset {:#x}...",
        file_path, offset
    );
    let (dir, name) = split_path(file_path);
    let locator = HostFileLocator::new(dir);
    let mut stream = match locator.open(name, FileMode::Open, FileAccess::Read, FileShare::Read) {
        Ok(stream) => stream,
        Err(err) => {
            error!("Could not open '{}': {}", file_path, err);
            std::process::exit(1);
        }
    };

    if let Err(err) = stream.seek(SeekFrom::Start(offset)) {
        error!("Could not seek to {:#x}: {}", offset, err);
        std::process::exit(1);
    }

    let database = match Database::read(stream.as_mut()) {
        Ok(database) => database,
        Err(err) => {
            error!("Could not load the database: {}", err);
            std::process::exit(1);
        }
    };

    if json {
        println!("{}", database.to_json());
        return;
    }

    info!("------------------------------------------------------------");
    info!("Disk group: {}", database.header().group_name);
    info!("Records: {}", database.len());
    for volume in database.volumes() {
        info!("Volume {:#x} '{}' ({})", volume.id, volume.name, volume.state);
        for component in database.volume_components(volume.id) {
            info!("  Component {:#x} '{}'", component.id, component.name);
            for extent in database.component_extents(component.id) {
                info!(
                    "    Extent {:#x} '{}': disk {:#x}, offset {:#x}, {:#x} sectors",
                    extent.id, extent.name, extent.disk_id, extent.disk_offset, extent.size
                );
            }
        }
    }
    if !database.check_references() {
        error!("The database contains dangling parent references.");
    }
    info!("------------------------------------------------------------");
}

fn dump_attributes(file_path: &str) {
    info!(
        "Dumping MFT attribute records from '{}'...",
        file_path
    );
    let (dir, name) = split_path(file_path);
    let locator = HostFileLocator::new(dir);
    let mut stream = match locator.open(name, FileMode::Open, FileAccess::Read, FileShare::Read) {
        Ok(stream) => stream,
        Err(err) => {
            error!("Could not open '{}': {}", file_path, err);
            std::process::exit(1);
        }
    };

    let mut raw = Vec::new();
    if let Err(err) = stream.read_to_end(&mut raw) {
        error!("Could not read '{}': {}", file_path, err);
        std::process::exit(1);
    }

    let mut offset = 0usize;
    let mut stdout = std::io::stdout();
    while offset + 4 <= raw.len() {
        let tag = u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap());
        if tag == 0xFFFF_FFFF {
            break;
        }
        match AttributeRecord::from_bytes(&raw[offset..]) {
            Ok((record, consumed)) if consumed > 0 => {
                let mut attribute =
                    NtfsAttribute::from_record(FileRecordReference::new(0, 0), record);
                if let Err(err) = attribute.dump(&mut stdout, "", None) {
                    error!("Dump failed: {}", err);
                    break;
                }
                offset += consumed;
            }
            Ok(_) => break,
            Err(err) => {
                error!("Could not parse the record at offset {:#x}: {}", offset, err);
                break;
            }
        }
    }
}

/// Splits a path into its parent directory and file name, with `/`
/// semantics matching the locators.
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

fn main() {
    let matches = Command::new("exhume_vdisk")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Exhume metadata structures from virtual disk images.")
        .arg(
            Arg::new("descriptor")
                .short('d')
                .long("descriptor")
                .value_parser(value_parser!(String))
                .help("Dump a VMDK descriptor file."),
        )
        .arg(
            Arg::new("ldm")
                .short('m')
                .long("ldm")
                .value_parser(value_parser!(String))
                .help("Dump the LDM database found in the given raw image."),
        )
        .arg(
            Arg::new("attributes")
                .short('a')
                .long("attributes")
                .value_parser(value_parser!(String))
                .help("Dump NTFS attribute records from a saved record blob."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Byte offset of the LDM database within the image."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Emit JSON instead of log lines."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let log_level_str = matches.get_one::<String>("log_level").unwrap();
    let level_filter = match log_level_str.as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    env_logger::Builder::new().filter_level(level_filter).init();

    let json = matches.get_flag("json");
    let offset = matches.get_one::<u64>("offset").unwrap_or(&0);

    if let Some(path) = matches.get_one::<String>("descriptor") {
        dump_descriptor(path, json);
    } else if let Some(path) = matches.get_one::<String>("ldm") {
        dump_ldm(path, *offset, json);
    } else if let Some(path) = matches.get_one::<String>("attributes") {
        dump_attributes(path);
    } else {
        error!("Nothing to do: pass --descriptor, --ldm or --attributes.");
        std::process::exit(1);
    }
}
