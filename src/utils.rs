use easy_error::format_err;
use log::trace;
use std::error::Error;
use std::process::Command;
use std::process::Stdio;

pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

fn cmd_str(cmd: &str, args: &[&str]) -> String {
    let mut concatenated_arg = String::from(cmd);
    for arg in args {
        concatenated_arg += " ";
        concatenated_arg += arg;
    }
    concatenated_arg
}

fn exec_raw(cmd: &str, args: &[&str]) -> Result<ExecOutput, Box<dyn Error>> {
    let cmd_str = cmd_str(cmd, args);
    trace!("exec {}", cmd_str);
    let output = Command::new(cmd)
        .args(args)
        .stdout(Stdio::piped())
        .stdout(Stdio::piped())
        .output()?;
    let stdout = String::from_utf8(output.stdout)?;
    let stderr = String::from_utf8(output.stderr)?;
    let success = output.status.success();
    if !success {
        if !stdout.is_empty() {
            trace!("{} stdout: {}", cmd_str, stdout);
        }
        if !stderr.is_empty() {
            trace!("{} stderr: {}", cmd_str, stderr);
        }
    }
    Ok(ExecOutput {
        success,
        stdout,
        stderr,
    })
}

pub fn exec(cmd: &str, args: &[&str]) -> Result<ExecOutput, Box<dyn Error>> {
    let output = exec_raw(cmd, args)?;
    if !output.success {
        return Err(Box::new(format_err!("{} {:?} exited non zero", cmd, args)));
    }
    Ok(output)
}

