use super::*;
use rdfuse_core::{download, download_with, ensure_idle, DownloadRequest, NoProgress, PollLimit};

const SMALL_PAGES: &str = "@Internal Flash  /0x08000000/128*0002Kg";

fn device(alt_name: &str) -> DummyDfuse {
    DummyDfuse::new(DummyConfig {
        alt_name: alt_name.to_string(),
        ..Default::default()
    })
    .unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_download_three_pages() {
    let mut dev = device(SMALL_PAGES);
    let firmware = pattern(6144);

    let written = download(&mut dev, 2048, &firmware, Some("0x08000000")).unwrap();
    assert_eq!(written, 6144);

    assert_eq!(
        dev.requests(),
        &[
            Request::Command(DfuseCommand::ErasePage, 0x0800_0000),
            Request::Command(DfuseCommand::ErasePage, 0x0800_0800),
            Request::Command(DfuseCommand::ErasePage, 0x0800_1000),
            Request::Command(DfuseCommand::SetAddress, 0x0800_0000),
            Request::Write {
                address: 0x0800_0000,
                len: 2048
            },
            Request::Command(DfuseCommand::SetAddress, 0x0800_0800),
            Request::Write {
                address: 0x0800_0800,
                len: 2048
            },
            Request::Command(DfuseCommand::SetAddress, 0x0800_1000),
            Request::Write {
                address: 0x0800_1000,
                len: 2048
            },
            Request::Abort,
        ]
    );
    assert_eq!(dev.memory(0x0800_0000, 6144), Some(&firmware[..]));
    assert_eq!(dev.state(), DfuState::DfuIdle);
}

#[test]
fn test_download_overwrites_programmed_flash() {
    let mut dev = DummyDfuse::new(DummyConfig::default()).unwrap();
    download(&mut dev, 2048, &[0x00; 4096], Some("0x08000000")).unwrap();

    // Page erase makes the second image programmable
    let firmware = pattern(4096);
    download(&mut dev, 2048, &firmware, Some("0x08000000")).unwrap();
    assert_eq!(dev.memory(0x0800_0000, 4096), Some(&firmware[..]));
}

#[test]
fn test_download_across_sectors() {
    let mut dev = DummyDfuse::new(DummyConfig::default()).unwrap();
    let firmware = pattern(512);

    download(&mut dev, 2048, &firmware, Some("0x0800FF00")).unwrap();

    let erases: Vec<&Request> = dev
        .requests()
        .iter()
        .filter(|r| matches!(r, Request::Command(DfuseCommand::ErasePage, _)))
        .collect();
    assert_eq!(
        erases,
        vec![
            &Request::Command(DfuseCommand::ErasePage, 0x0800_FF00),
            &Request::Command(DfuseCommand::ErasePage, 0x0801_00FF),
        ]
    );
    assert_eq!(dev.memory(0x0800_FF00, 256), Some(&firmware[..256]));
    assert_eq!(dev.memory(0x0801_0000, 256), Some(&firmware[256..]));
}

#[test]
fn test_leave() {
    let mut dev = device(SMALL_PAGES);
    download(&mut dev, 2048, &pattern(1024), Some("0x08000000:leave")).unwrap();

    let requests = dev.requests();
    assert_eq!(
        &requests[requests.len() - 3..],
        &[
            Request::Abort,
            Request::Command(DfuseCommand::SetAddress, 0x0800_0000),
            Request::Leave {
                address: 0x0800_0000
            },
        ]
    );
    assert_eq!(dev.state(), DfuState::DfuManifest);
}

#[test]
fn test_mass_erase_false_timeout() {
    let mut dev = DummyDfuse::new(DummyConfig::default())
        .unwrap()
        .with_quirks(DummyQuirks {
            mass_erase_false_timeout: true,
            ..Default::default()
        });

    assert_eq!(download(&mut dev, 2048, &[], Some(":mass-erase:force")), Ok(0));
    assert_eq!(
        dev.requests(),
        &[Request::Command(DfuseCommand::MassErase, 0), Request::Abort]
    );
    assert_eq!(dev.delays(), &[35_000]);
}

#[test]
fn test_mass_erase_regular_timeout() {
    let mut dev = DummyDfuse::new(DummyConfig::default()).unwrap();
    download(&mut dev, 2048, &[], Some(":mass-erase:force")).unwrap();
    assert_eq!(dev.delays(), &[25_000]);
}

#[test]
fn test_mass_erase_replaces_page_erase() {
    let mut dev = DummyDfuse::new(DummyConfig::default()).unwrap();
    download(&mut dev, 2048, &[0x00; 2048], Some("0x08000000")).unwrap();

    let firmware = pattern(2048);
    let before = dev.requests().len();
    download(&mut dev, 2048, &firmware, Some("0x08000000:mass-erase:force")).unwrap();

    assert!(!dev.requests()[before..]
        .iter()
        .any(|r| matches!(r, Request::Command(DfuseCommand::ErasePage, _))));
    assert_eq!(dev.memory(0x0800_0000, 2048), Some(&firmware[..]));
}

#[test]
fn test_unprotect() {
    let mut dev = DummyDfuse::new(DummyConfig::default()).unwrap();
    assert_eq!(
        download(&mut dev, 2048, &pattern(64), Some("0x08000000:unprotect:force")),
        Ok(0)
    );
    assert!(dev.unprotected());
    assert_eq!(
        dev.requests(),
        &[Request::Command(DfuseCommand::ReadUnprotect, 0)]
    );
}

#[test]
fn test_unprotect_without_force() {
    let mut dev = DummyDfuse::new(DummyConfig::default()).unwrap();
    assert_eq!(
        download(&mut dev, 2048, &pattern(64), Some(":unprotect")),
        Err(Error::UnsafeOperation("unprotect"))
    );
    assert!(dev.requests().is_empty());
    assert!(!dev.unprotected());
}

#[test]
fn test_short_write() {
    let mut dev = device(SMALL_PAGES).with_quirks(DummyQuirks {
        short_write: Some(100),
        ..Default::default()
    });

    let err = download(&mut dev, 2048, &pattern(4096), Some("0x08000000")).unwrap_err();
    assert_eq!(
        err,
        Error::ShortWrite {
            address: 0x0800_0000,
            sent: 100,
            expected: 2048,
        }
    );
    assert_eq!(
        dev.requests().last(),
        Some(&Request::Write {
            address: 0x0800_0000,
            len: 100
        })
    );
}

#[test]
fn test_read_only_segment() {
    let mut dev = device("@Option Bytes  /0x1FFFC000/01*016 a");
    let err = download(&mut dev, 2048, &[0x55; 16], Some("0x1FFFC000")).unwrap_err();
    assert_eq!(
        err,
        Error::ChunkWriteFailed {
            state: DfuState::DfuError,
            status: DfuStatusCode::ErrWrite,
        }
    );
    // Not erasable: no erase pass
    assert_eq!(
        dev.requests()[0],
        Request::Command(DfuseCommand::SetAddress, 0x1FFF_C000)
    );
}

#[test]
fn test_failed_write_status() {
    let mut dev = device(SMALL_PAGES).with_quirks(DummyQuirks {
        fail_writes: Some(DfuStatusCode::ErrVerify),
        ..Default::default()
    });
    let err = download(&mut dev, 2048, &pattern(2048), Some("0x08000000")).unwrap_err();
    assert_eq!(
        err,
        Error::ChunkWriteFailed {
            state: DfuState::DfuError,
            status: DfuStatusCode::ErrVerify,
        }
    );
}

#[test]
fn test_device_never_busy() {
    let mut dev = device(SMALL_PAGES).with_quirks(DummyQuirks {
        skip_busy: true,
        ..Default::default()
    });
    let err = download(&mut dev, 2048, &pattern(2048), Some("0x08000000")).unwrap_err();
    assert_eq!(
        err,
        Error::UnexpectedState {
            command: DfuseCommand::ErasePage,
            state: DfuState::DfuDnloadIdle,
            status: DfuStatusCode::Ok,
        }
    );
}

#[test]
fn test_endless_busy_times_out() {
    let mut dev = device(SMALL_PAGES).with_quirks(DummyQuirks {
        endless_busy: true,
        ..Default::default()
    });
    let firmware = pattern(2048);
    let request = DownloadRequest {
        poll_limit: PollLimit {
            max_polls: Some(10),
            max_wait_ms: None,
        },
        ..DownloadRequest::new(2048, &firmware, Some("0x08000000"))
    };

    let err = download_with(&mut dev, &request, &mut NoProgress).unwrap_err();
    assert_eq!(
        err,
        Error::Timeout {
            polls: 10,
            waited_ms: 250
        }
    );
    assert_eq!(dev.polls(), 10);
}

#[test]
fn test_stall_and_recover() {
    let mut dev = device(SMALL_PAGES);
    let set_address = DfuseCommand::SetAddress.encode(0x0800_0000);

    dev.download(0, &set_address).unwrap();
    // Downloading again without polling is a protocol error
    assert!(matches!(dev.download(0, &set_address), Err(Error::Transport(_))));
    assert_eq!(dev.state(), DfuState::DfuError);

    ensure_idle(&mut dev).unwrap();
    assert_eq!(dev.state(), DfuState::DfuIdle);
    assert_eq!(dev.requests().last(), Some(&Request::ClearStatus));
}

#[test]
fn test_unsupported_command_stalls() {
    let mut dev = device(SMALL_PAGES);
    assert!(dev.download(0, &[0x33]).is_err());
    let status = dev.get_status().unwrap();
    assert_eq!(status.state, DfuState::DfuError);
    assert_eq!(status.status, DfuStatusCode::ErrStalledPkt);
}

#[test]
fn test_write_beyond_address_space_stalls() {
    let mut dev = DummyDfuse::new(DummyConfig {
        alt_name: SMALL_PAGES.to_string(),
        transfer_size: 1 << 20,
        ..Default::default()
    })
    .unwrap();
    assert!(matches!(
        dev.download(0xFFFF, &[0u8; 16]),
        Err(Error::Transport(_))
    ));
    assert!(dev.requests().is_empty());
    let status = dev.get_status().unwrap();
    assert_eq!(status.state, DfuState::DfuError);
    assert_eq!(status.status, DfuStatusCode::ErrStalledPkt);
}
