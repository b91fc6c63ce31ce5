// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2022 Takashi Sakamoto

use {
    super::{LogLevel, RuntimeOperation},
    clap::Parser,
    glib::{Error, FileError},
    gmsl_serdes_protocols::GmslLinkError,
    sdrv_csi_protocols::{kstream::KstreamError, mipi_csi2::CsiHostError},
};

pub trait ServiceCmd<A, T, R>: Sized
where
    A: Parser,
    R: RuntimeOperation<T>,
{
    fn params(args: &A) -> (T, Option<LogLevel>);

    fn run() {
        let code = A::try_parse()
            .map_err(|err| err.to_string())
            .map(|args| Self::params(&args))
            .and_then(|(params, log_level)| {
                R::new(params, log_level)
                    .and_then(|mut runtime| {
                        runtime.listen()?;
                        runtime.run()?;
                        Ok(libc::EXIT_SUCCESS)
                    })
                    .map_err(|err| specific_err_to_string(&err))
            })
            .unwrap_or_else(|msg| {
                eprintln!("{}", msg);
                libc::EXIT_FAILURE
            });

        std::process::exit(code)
    }
}

fn specific_err_to_string(e: &Error) -> String {
    let (domain, cause) = if let Some(error) = e.kind::<FileError>() {
        (
            "Linux file operation error",
            match error {
                FileError::Acces => "Access permission",
                FileError::Noent => "Not exists",
                FileError::Nxio => "Chip does not answer",
                FileError::Nodev => "Device is not found",
                FileError::Inval => "Invalid argument",
                FileError::Io => "Transaction failure",
                FileError::Nomem => "Memory is exhausted",
                FileError::Again => "Not ready yet",
                _ => "",
            },
        )
    } else if let Some(error) = e.kind::<GmslLinkError>() {
        (
            "GMSL link operation error",
            match error {
                GmslLinkError::State => "Links are not in the state for the operation",
                GmslLinkError::NoLink => "Any link is not locked",
                _ => "",
            },
        )
    } else if let Some(error) = e.kind::<CsiHostError>() {
        (
            "MIPI CSI-2 host operation error",
            match error {
                CsiHostError::Version => "Unexpected version of controller",
                CsiHostError::PhyFreq => "Rate of lane is out of range",
                _ => "",
            },
        )
    } else if e.is::<KstreamError>() {
        ("Image pipe operation error", "")
    } else {
        ("Unknown domain error", "")
    };
    format!("{}: {}, {}", domain, cause, e)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_strings() {
        let e = Error::new(FileError::Nxio, "max9286 does not answer");
        assert_eq!(
            specific_err_to_string(&e),
            "Linux file operation error: Chip does not answer, max9286 does not answer"
        );

        let e = Error::new(CsiHostError::PhyFreq, "out of range");
        assert_eq!(
            specific_err_to_string(&e),
            "MIPI CSI-2 host operation error: Rate of lane is out of range, out of range"
        );

        let e = Error::new(GmslLinkError::Invalid(10), "unknown");
        assert_eq!(
            specific_err_to_string(&e),
            "GMSL link operation error: , unknown"
        );
    }
}
