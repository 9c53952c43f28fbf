//! ISO 9660 mastering and inspection through genisoimage and isoinfo

use super::{Extensions, IsoBackend};
use crate::command::{path_to_str, run_cmd};
use crate::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Shells out to `genisoimage` to build images and `isoinfo` to read them
#[derive(Debug, Clone)]
pub struct GenIsoImage {
    pub generator: String,
    pub inspector: String,
}

impl Default for GenIsoImage {
    fn default() -> Self {
        Self {
            generator: "genisoimage".to_string(),
            inspector: "isoinfo".to_string(),
        }
    }
}

impl GenIsoImage {
    pub fn new() -> Self {
        Self::default()
    }

    fn image_file(&self, image: &[u8]) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("vmango-iso")
            .suffix(".iso")
            .tempfile()?;
        file.write_all(image)?;
        file.flush()?;
        Ok(file)
    }

    fn naming_flag(extensions: Extensions) -> &'static str {
        if extensions.rock_ridge {
            "-R"
        } else {
            "-J"
        }
    }
}

/// Extract the extension flags from `isoinfo -d` output
pub(crate) fn parse_descriptor(output: &str) -> Extensions {
    let mut extensions = Extensions::default();
    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("Joliet with UCS level") {
            extensions.joliet = true;
        }
        if line.starts_with("Rock Ridge signatures") && line.ends_with("found") {
            extensions.rock_ridge = true;
        }
    }
    extensions
}

impl IsoBackend for GenIsoImage {
    fn generate(&self, root: &Path, label: &str, extensions: Extensions) -> Result<Vec<u8>> {
        let out_dir = tempfile::Builder::new().prefix("vmango-iso").tempdir()?;
        let output = out_dir.path().join("image.iso");

        let mut args = vec![
            "-output",
            path_to_str(&output)?,
            "-volid",
            label,
            "-input-charset",
            "utf-8",
            "-quiet",
        ];
        if extensions.rock_ridge {
            args.push("-R");
        }
        if extensions.joliet {
            args.push("-J");
        }
        args.push(path_to_str(root)?);

        run_cmd(&self.generator, &args)?
            .check(&self.generator)
            .context("cannot generate iso image")?;
        let image = fs::read(&output).context("cannot read generated iso image")?;
        Ok(image)
    }

    fn extensions(&self, image: &[u8]) -> Result<Extensions> {
        let file = self.image_file(image)?;
        let out = run_cmd(&self.inspector, &["-d", "-i", path_to_str(file.path())?])?
            .check(&self.inspector)
            .context("cannot inspect iso image")?;
        Ok(parse_descriptor(&out.stdout_str()))
    }

    fn read_file(
        &self,
        image: &[u8],
        extensions: Extensions,
        path: &str,
    ) -> Result<Option<Vec<u8>>> {
        let file = self.image_file(image)?;
        let image_path = path_to_str(file.path())?;
        let flag = Self::naming_flag(extensions);
        let wanted = format!("/{}", path.trim_start_matches('/'));

        let listing = run_cmd(&self.inspector, &["-i", image_path, flag, "-f"])?
            .check(&self.inspector)
            .context("cannot list iso image")?;
        if !listing.stdout_str().lines().any(|l| l.trim() == wanted) {
            return Ok(None);
        }

        let out = run_cmd(&self.inspector, &["-i", image_path, flag, "-x", wanted.as_str()])?
            .check(&self.inspector)
            .with_context(|| format!("cannot extract {} from iso image", wanted))?;
        Ok(Some(out.stdout))
    }
}
