use std::{path::Path, rc::Rc};

use super::command::{Cmd, CommandRunner};

/// Receives the artifacts of every finished run.
pub trait ResultHandler {
    fn handle_result(&self, path: &Path);
}

pub struct ResultIgnorer {}

impl ResultIgnorer {
    pub fn new() -> ResultIgnorer {
        ResultIgnorer {}
    }
}

impl ResultHandler for ResultIgnorer {
    fn handle_result(&self, path: &Path) {
        debug!("keeping {} locally", path.display());
    }
}

/// Pushes artifacts to a collection server with `curl -T`.
pub struct ResultsUploader {
    runner: Rc<dyn CommandRunner>,
    push_url: String,
}

impl ResultsUploader {
    pub fn new(runner: Rc<dyn CommandRunner>, url: String) -> Self {
        Self {
            runner,
            push_url: url,
        }
    }
}

impl ResultHandler for ResultsUploader {
    fn handle_result(&self, file: &Path) {
        if !file.exists() {
            error!(
                "can't handle result file which does not exist, '{}'",
                file.display()
            );
            return;
        }

        let res = self.runner.output(
            &Cmd::new("curl")
                .arg(&self.push_url)
                .arg("-T")
                .arg(file.to_string_lossy()),
        );

        match res {
            Ok(_) => info!("result file '{}' uploaded", file.display()),
            Err(err) => error!(
                "failed to upload results file '{}', error: {}",
                file.display(),
                err
            ),
        };
    }
}
