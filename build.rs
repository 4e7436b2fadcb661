use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=resources/");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let resources_root = manifest_dir.join("resources");
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let output_file = out_dir.join("embedded_resources.rs");

    let embedded_files = scan_resources(&resources_root);

    generate_embedded_resources_code(&embedded_files, &output_file);
}

const MAX_FILE_SIZE: usize = 10 * 1024 * 1024; // 10 MB

struct EmbeddedFile {
    filename: String,
    contents: Vec<u8>,
}

/// collect every regular file directly under resources/
fn scan_resources(resources_root: &Path) -> Vec<EmbeddedFile> {
    let mut files = Vec::new();

    if !resources_root.exists() {
        eprintln!(
            "Warning: resources directory not found at {:?}",
            resources_root
        );
        return files;
    }

    for entry in fs::read_dir(resources_root).unwrap_or_else(|e| {
        panic!(
            "Failed to read resources directory {:?}: {}",
            resources_root, e
        )
    }) {
        let entry = entry.unwrap_or_else(|e| {
            panic!(
                "Failed to read directory entry in {:?}: {}",
                resources_root, e
            )
        });
        let path = entry.path();

        if !path.is_file() {
            continue;
        }

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_else(|| panic!("Invalid filename: {:?}", path))
            .to_string();

        let contents =
            fs::read(&path).unwrap_or_else(|e| panic!("Failed to read file {:?}: {}", path, e));

        if contents.len() > MAX_FILE_SIZE {
            panic!(
                "File {:?} is {} bytes, exceeds max size of {} bytes",
                path,
                contents.len(),
                MAX_FILE_SIZE
            );
        }

        files.push(EmbeddedFile { filename, contents });
    }

    // stable output keeps rebuilds reproducible
    files.sort_by(|a, b| a.filename.cmp(&b.filename));

    eprintln!("Embedded {} resource file(s)", files.len());
    files
}

fn generate_embedded_resources_code(files: &[EmbeddedFile], output: &Path) {
    let mut code = String::new();

    code.push_str("// Auto-generated by build.rs - DO NOT EDIT\n");
    code.push_str("use std::collections::HashMap;\n");
    code.push_str("use once_cell::sync::Lazy;\n\n");

    code.push_str("/// Embedded resource files: filename -> base64 content\n");
    code.push_str(
        "pub static EMBEDDED_RESOURCES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {\n",
    );
    code.push_str("    let mut map = HashMap::new();\n");

    for file in files {
        code.push_str(&format!(
            "    map.insert(\"{}\", \"{}\");\n",
            file.filename,
            base64_encode(&file.contents)
        ));
    }

    code.push_str("    map\n");
    code.push_str("});\n\n");

    code.push_str("/// Get the base64 content of an embedded resource\n");
    code.push_str("pub fn get_resource(name: &str) -> Option<&'static str> {\n");
    code.push_str("    EMBEDDED_RESOURCES.get(name).copied()\n");
    code.push_str("}\n\n");

    code.push_str("/// Names of all embedded resources, sorted\n");
    code.push_str("pub fn resource_names() -> Vec<&'static str> {\n");
    code.push_str("    let mut names: Vec<&'static str> = EMBEDDED_RESOURCES.keys().copied().collect();\n");
    code.push_str("    names.sort_unstable();\n");
    code.push_str("    names\n");
    code.push_str("}\n");

    fs::write(output, code).expect("failed to write embedded resources code");
}

fn base64_encode(data: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose};
    general_purpose::STANDARD.encode(data)
}
