use sha2::{Digest, Sha256};
use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let migrations_dir = manifest_dir.join("migrations");
    println!("cargo:rerun-if-changed={}", migrations_dir.display());

    let mut migrations = collect_migrations(&migrations_dir);
    migrations.sort_by_key(|m| m.version);

    for pair in migrations.windows(2) {
        if pair[0].version == pair[1].version {
            panic!("duplicate migration version v{}", pair[0].version);
        }
    }

    let mut out = String::new();
    out.push_str("/// Migrations bundled into this build, sorted by version.\n");
    out.push_str("pub static BUNDLED_MIGRATIONS: &[BundledMigration] = &[\n");
    for m in &migrations {
        writeln!(
            out,
            "    BundledMigration {{ version: {}, description: {:?}, checksum: {:?}, sql: include_str!({:?}) }},",
            m.version,
            m.description,
            m.checksum,
            m.path.display().to_string()
        )
        .unwrap();
    }
    out.push_str("];\n\n");

    let required = migrations.last().map(|m| m.version).unwrap_or(0);
    out.push_str("/// Schema version this build requires; the highest bundled migration.\n");
    writeln!(out, "pub const REQUIRED_SCHEMA_VERSION: i64 = {};", required).unwrap();

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap()).join("migrations.rs");
    fs::write(out_path, out).unwrap();
}

struct Found {
    version: i64,
    description: String,
    checksum: String,
    path: PathBuf,
}

fn collect_migrations(dir: &Path) -> Vec<Found> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for entry in entries {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        println!("cargo:rerun-if-changed={}", path.display());

        let stem = path.file_stem().unwrap().to_string_lossy().to_string();
        // V<version>__<description>.sql
        let (version, description) = stem
            .strip_prefix('V')
            .and_then(|rest| rest.split_once("__"))
            .unwrap_or_else(|| panic!("migration file name must be V<n>__<name>.sql: {}", stem));
        let version: i64 = version
            .parse()
            .unwrap_or_else(|_| panic!("invalid migration version in {}", stem));

        let sql = fs::read_to_string(&path).unwrap();
        let checksum = Sha256::digest(sql.as_bytes())
            .iter()
            .fold(String::with_capacity(64), |mut acc, b| {
                let _ = write!(acc, "{:02x}", b);
                acc
            });

        found.push(Found {
            version,
            description: description.replace('_', " "),
            checksum,
            path,
        });
    }
    found
}
