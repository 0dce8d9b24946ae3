use meterpki::audit::{self, AuditConfig, LogDestination};
use meterpki::channel::{self, Credentials, TrustAnchor};
use meterpki::config::{BackendTlsEnv, PkiConfig};
use meterpki::provisioning::{
    self, inspect_certificate, CertificateAuthority, DeviceProvisioner, DeviceRecord,
    HttpTransport, JsonDeviceRegistry, ProvisioningService, RetryPolicy, Role, ROOT_NAME,
};
use meterpki::store::{FileKeyStore, KeyMaterialStore};
use meterpki::{server, PkiError};

use meterpki::reexports::log;

use clap::{crate_description, crate_name, crate_version, Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Read a text file with a readable error
fn read_file(path: impl AsRef<Path>) -> Result<String, PkiError> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|e| {
        PkiError::InternalError(format!("Failed to open file '{}': {}", path.display(), e))
    })
}

fn store_arg() -> Arg {
    Arg::new("store")
        .long("store")
        .short('s')
        .value_name("DIR")
        .help("CA key-material directory (default from config: certs)")
}

fn registry_arg() -> Arg {
    Arg::new("registry")
        .long("registry")
        .short('r')
        .value_name("FILE")
        .help("Device registry JSON file")
}

fn open_store(matches: &ArgMatches, config: &PkiConfig) -> Result<FileKeyStore, PkiError> {
    let dir = matches
        .get_one::<String>("store")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.store.directory.clone());
    FileKeyStore::open(dir)
}

fn load_authority(
    store: &dyn KeyMaterialStore,
    config: &PkiConfig,
) -> Result<CertificateAuthority, PkiError> {
    let material = store.load(ROOT_NAME).map_err(|e| match e {
        PkiError::NotFound(_) => {
            PkiError::UsageError("No root CA in the store; run `bootstrap` first")
        }
        other => other,
    })?;
    CertificateAuthority::from_key_material(&material, &config.ca_config())
}

fn start() -> Result<(), PkiError> {
    let matches = Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("debug")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Prints debugging information"),
        )
        .arg(
            Arg::new("audit")
                .long("audit")
                .action(ArgAction::SetTrue)
                .help("Enable structured audit logging (JSON to stderr)"),
        )
        .arg(
            Arg::new("audit-file")
                .long("audit-file")
                .value_name("FILE")
                .help("Write audit logs to FILE instead of stderr"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .subcommand(
            Command::new("bootstrap")
                .about("Create the root CA and the server and backend identities")
                .arg(store_arg()),
        )
        .subcommand(
            Command::new("issue")
                .about("Issue an additional identity signed by the root")
                .arg(store_arg())
                .arg(
                    Arg::new("role")
                        .long("role")
                        .value_parser(["server", "backend", "device"])
                        .required(true)
                        .help("Identity class"),
                )
                .arg(
                    Arg::new("name")
                        .long("name")
                        .short('n')
                        .value_name("CN")
                        .required(true)
                        .help("Subject common name"),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .short('o')
                        .value_name("NAME")
                        .required(true)
                        .help("Store name for the new pair (<NAME>.crt / <NAME>.key)"),
                )
                .arg(
                    Arg::new("days")
                        .long("days")
                        .value_name("DAYS")
                        .value_parser(clap::value_parser!(u32))
                        .help("Validity in days (default from config)"),
                ),
        )
        .subcommand(
            Command::new("register")
                .about("Add a device serial number to the registry")
                .arg(registry_arg())
                .arg(
                    Arg::new("serial")
                        .long("serial")
                        .value_name("SERIAL")
                        .required(true)
                        .help("Device serial number"),
                )
                .arg(
                    Arg::new("name")
                        .long("name")
                        .short('n')
                        .value_name("NAME")
                        .help("Display name"),
                ),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the provisioning endpoint")
                .arg(store_arg())
                .arg(registry_arg())
                .arg(
                    Arg::new("listen")
                        .long("listen")
                        .short('l')
                        .value_name("ADDR")
                        .help("Listen address (default from config: 0.0.0.0:3000)"),
                ),
        )
        .subcommand(
            Command::new("provision")
                .about("Device side: load the stored identity or request one")
                .arg(
                    Arg::new("url")
                        .long("url")
                        .short('u')
                        .value_name("URL")
                        .required(true)
                        .help("Provisioning endpoint base URL"),
                )
                .arg(
                    Arg::new("serial")
                        .long("serial")
                        .value_name("SERIAL")
                        .required(true)
                        .help("Device serial number"),
                )
                .arg(
                    Arg::new("data-dir")
                        .long("data-dir")
                        .value_name("DIR")
                        .required(true)
                        .help("Device key-material directory"),
                )
                .arg(
                    Arg::new("ca")
                        .long("ca")
                        .value_name("FILE")
                        .help("Pinned root certificate (PEM)"),
                )
                .arg(
                    Arg::new("max-attempts")
                        .long("max-attempts")
                        .value_name("N")
                        .value_parser(clap::value_parser!(u32))
                        .help("Give up after N attempts (default: retry forever)"),
                ),
        )
        .subcommand(
            Command::new("connect")
                .about("Check a mutual-TLS handshake against a server")
                .arg(
                    Arg::new("addr")
                        .long("addr")
                        .value_name("HOST:PORT")
                        .required(true)
                        .help("Server address"),
                )
                .arg(
                    Arg::new("server-name")
                        .long("server-name")
                        .value_name("NAME")
                        .default_value("localhost")
                        .help("Expected server name"),
                )
                .arg(
                    Arg::new("backend")
                        .long("backend")
                        .action(ArgAction::SetTrue)
                        .conflicts_with_all(["data-dir", "serial"])
                        .help("Use the backend identity from CA_CERT_B64/BACKEND_CERT_B64/BACKEND_KEY_B64"),
                )
                .arg(
                    Arg::new("data-dir")
                        .long("data-dir")
                        .value_name("DIR")
                        .required_unless_present("backend")
                        .help("Device key-material directory"),
                )
                .arg(
                    Arg::new("serial")
                        .long("serial")
                        .value_name("SERIAL")
                        .required_unless_present("backend")
                        .help("Device serial number"),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("Print the details of a certificate")
                .arg(
                    Arg::new("cert")
                        .long("cert")
                        .value_name("FILE")
                        .required(true)
                        .help("PEM certificate file"),
                ),
        )
        .get_matches();

    let debug = matches.get_flag("debug");
    let audit_enabled = matches.get_flag("audit");
    let audit_file = matches.get_one::<String>("audit-file").map(|s| s.as_str());

    env_logger::builder()
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if audit_enabled || audit_file.is_some() {
        let destination = match audit_file {
            Some(path) => LogDestination::File(path.to_string()),
            None => LogDestination::Stderr,
        };
        audit::init(AuditConfig {
            destination,
            ..AuditConfig::default()
        })?;
    }

    let config = match matches.get_one::<String>("config") {
        Some(path) => PkiConfig::load(path)?,
        None => PkiConfig::default(),
    };

    if let Some(matches) = matches.subcommand_matches("bootstrap") {
        let store = open_store(matches, &config)?;
        let report = provisioning::bootstrap(&store, &config)?;

        println!("Root CA:  {}", report.authority.subject_name());
        for (name, created) in [
            (provisioning::SERVER_NAME, report.server_created),
            (provisioning::BACKEND_NAME, report.backend_created),
        ] {
            println!(
                "{:<9} {}",
                format!("{}:", name),
                if created { "created" } else { "already present" }
            );
        }
        println!("Store:    {}", store.root().display());
        println!();
        println!("# Backend environment");
        for line in report.env_exports() {
            println!("{}", line);
        }
    } else if let Some(matches) = matches.subcommand_matches("issue") {
        let store = open_store(matches, &config)?;
        let authority = load_authority(&store, &config)?;
        let role = Role::from_str(
            matches
                .get_one::<String>("role")
                .ok_or(PkiError::UsageError("Missing --role"))?,
        )?;
        let name = matches
            .get_one::<String>("name")
            .ok_or(PkiError::UsageError("Missing --name"))?;
        let out = matches
            .get_one::<String>("out")
            .ok_or(PkiError::UsageError("Missing --out"))?;
        let days = match matches.get_one::<u32>("days") {
            Some(days) => *days,
            None if role == Role::Device => config.identities.device_validity_days,
            None => config.identities.service_validity_days,
        };

        if store.exists(out)? {
            return Err(PkiError::InvalidArgument(format!(
                "'{}' already exists in {}",
                out,
                store.root().display()
            )));
        }
        let identity = authority.issue_service_certificate(role, name, days)?;
        store.save(out, &identity.key_material())?;
        println!(
            "Issued {} certificate for '{}' (serial {}) to {}",
            role,
            name,
            identity.certificate.serial_hex(),
            store.certificate_path(out).display()
        );
    } else if let Some(matches) = matches.subcommand_matches("register") {
        let path = matches
            .get_one::<String>("registry")
            .map(PathBuf::from)
            .unwrap_or_else(|| config.server.registry.clone());
        let serial = matches
            .get_one::<String>("serial")
            .ok_or(PkiError::UsageError("Missing --serial"))?;

        let mut record = DeviceRecord::new(serial.as_str())?;
        if let Some(name) = matches.get_one::<String>("name") {
            record = record.with_name(name.as_str());
        }
        let registry = JsonDeviceRegistry::open(&path)?;
        registry.register(record.clone())?;
        println!("Registered {} in {}", record, path.display());
    } else if let Some(matches) = matches.subcommand_matches("serve") {
        let store = open_store(matches, &config)?;
        let authority = load_authority(&store, &config)?;
        let registry_path = matches
            .get_one::<String>("registry")
            .map(PathBuf::from)
            .unwrap_or_else(|| config.server.registry.clone());
        let listen = matches
            .get_one::<String>("listen")
            .cloned()
            .unwrap_or_else(|| config.server.listen.clone());

        let registry = JsonDeviceRegistry::open(&registry_path)?;
        log::info!(
            "Serving {} registered devices from {}",
            registry.len(),
            registry_path.display()
        );
        let service = Arc::new(
            ProvisioningService::new(Arc::new(authority), Arc::new(registry))
                .with_device_validity_days(config.identities.device_validity_days),
        );

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(server::serve(&listen, service, async {
            if tokio::signal::ctrl_c().await.is_err() {
                log::warn!("Cannot listen for Ctrl-C; stop the process to shut down");
                std::future::pending::<()>().await;
            }
        }))?;
    } else if let Some(matches) = matches.subcommand_matches("provision") {
        let url = matches
            .get_one::<String>("url")
            .ok_or(PkiError::UsageError("Missing --url"))?;
        let serial = matches
            .get_one::<String>("serial")
            .ok_or(PkiError::UsageError("Missing --serial"))?;
        let data_dir = matches
            .get_one::<String>("data-dir")
            .ok_or(PkiError::UsageError("Missing --data-dir"))?;

        let store = Arc::new(FileKeyStore::open(data_dir)?);
        let mut provisioner =
            DeviceProvisioner::new(serial.as_str(), HttpTransport::new(url.as_str()), store.clone())?;
        if let Some(ca_file) = matches.get_one::<String>("ca") {
            provisioner = provisioner.with_trust_anchor(&read_file(ca_file)?)?;
        }
        let policy = RetryPolicy {
            max_attempts: matches.get_one::<u32>("max-attempts").copied(),
            ..RetryPolicy::default()
        };

        let credentials = provisioner.load_or_provision_with_retry(&policy)?;
        let info = inspect_certificate(&credentials.certificate_pem)?;
        println!("Device {} provisioned", credentials.serial_number);
        println!("Certificate: {}", store.certificate_path(serial).display());
        println!("Serial:      {}", info.serial_hex);
        println!("Expires:     {}", info.not_after);
    } else if let Some(matches) = matches.subcommand_matches("connect") {
        let addr = matches
            .get_one::<String>("addr")
            .ok_or(PkiError::UsageError("Missing --addr"))?;
        let server_name = matches
            .get_one::<String>("server-name")
            .ok_or(PkiError::UsageError("Missing --server-name"))?;

        let client = if matches.get_flag("backend") {
            BackendTlsEnv::from_env()?.client_config()?
        } else {
            let data_dir = matches
                .get_one::<String>("data-dir")
                .ok_or(PkiError::UsageError("Missing --data-dir"))?;
            let serial = matches
                .get_one::<String>("serial")
                .ok_or(PkiError::UsageError("Missing --serial"))?;
            let store = FileKeyStore::open(data_dir)?;
            channel::build_client_config(
                &TrustAnchor::from_store(&store, ROOT_NAME)?,
                &Credentials::from_store(&store, serial)?,
                serial.as_str(),
            )?
        };

        let mut stream = client.connect(addr.as_str(), server_name)?;
        println!(
            "Connected to {} as {} ({:?}, {:?})",
            addr,
            client.client_id(),
            stream.conn.protocol_version(),
            stream.conn.negotiated_cipher_suite().map(|s| s.suite())
        );
        stream.conn.send_close_notify();
        let _ = stream.conn.complete_io(&mut stream.sock);
    } else if let Some(matches) = matches.subcommand_matches("inspect") {
        let cert_file = matches
            .get_one::<String>("cert")
            .ok_or(PkiError::UsageError("Missing --cert"))?;
        let info = inspect_certificate(&read_file(cert_file)?)?;

        println!("Subject:     {}", info.subject);
        println!("Issuer:      {}", info.issuer);
        println!("Serial:      {}", info.serial_hex);
        println!("Not before:  {}", info.not_before);
        println!("Not after:   {}", info.not_after);
        println!("Fingerprint: {}", info.fingerprint);
        println!("CA:          {}", info.is_ca);
        if !info.extended_key_usages.is_empty() {
            println!("Usage:       {}", info.extended_key_usages.join(", "));
        }
    } else {
        return Err(PkiError::UsageError("No subcommand specified"));
    }
    Ok(())
}

fn main() -> Result<(), PkiError> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    Ok(())
}
