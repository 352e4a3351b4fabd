// vim: tw=80

/// Write and read data through a RAID-Y vdev using a random access pattern,
/// verifying every byte read back matches what a shadow in-memory copy
/// expects, including after simulated child faults.
mod vdev_raid {
    use std::fs;

    use pretty_assertions::assert_eq;
    use raidy_core::{
        config::{ChildSpec, Config},
        vdev::ChildVdev,
        vdev_file::VdevFile,
        vdev_raid::VdevRaidY,
    };
    use rand::{thread_rng, Rng, RngCore, SeedableRng};
    use rand_xorshift::XorShiftRng;
    use rstest::rstest;
    use tempfile::{Builder, TempDir};
    use uuid::Uuid;

    /// Scale factor for the torture test's total byte count. Kept small by
    /// default so the suite runs in CI time; bump for a manual deep pass.
    fn test_scale() -> f64 {
        std::env::var("RAIDY_TORTURE_SCALE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1.0)
    }

    /// Deterministic byte pattern for offset `ofs`, so a read can be
    /// checked against its expected contents without keeping a full shadow
    /// buffer around.
    fn mkbuf(ofs: u64, len: usize) -> Vec<u8> {
        const Z: usize = std::mem::size_of::<u64>();
        (0..len)
            .map(|i| {
                let bofs = ofs as usize + i - i % Z;
                let bshift = 8 * (Z - 1 - i % Z);
                ((bofs >> bshift) & 0xFF) as u8
            })
            .collect()
    }

    struct Harness {
        tempdir: TempDir,
        paths: Vec<std::path::PathBuf>,
        ndata: u8,
        nparity: u8,
        stripe_size: u32,
    }

    fn harness(ndata: u8, nparity: u8, stripe_size: u32) -> Harness {
        let child_len = 1 << 24; // 16 MiB per child
        let tempdir = Builder::new().prefix("raidy_torture").tempdir().unwrap();
        let n = ndata + nparity;
        let paths = (0..n)
            .map(|i| {
                let path = tempdir.path().join(format!("child{i}"));
                let file = fs::File::create(&path).unwrap();
                file.set_len(child_len).unwrap();
                path
            })
            .collect();
        Harness { tempdir, paths, ndata, nparity, stripe_size }
    }

    fn config(h: &Harness) -> Config {
        Config {
            vdev_type: "raidy".to_string(),
            nparity: h.nparity,
            children: h.paths.iter().map(|p| ChildSpec { path: p.clone() }).collect(),
            stripe_size: Some(h.stripe_size),
        }
    }

    async fn create_vdev(h: &Harness, uuid: Uuid) -> VdevRaidY {
        let children: Vec<Box<dyn ChildVdev>> = h
            .paths
            .iter()
            .enumerate()
            .map(|(i, p)| Box::new(VdevFile::create(p, uuid, i).unwrap()) as Box<dyn ChildVdev>)
            .collect();
        VdevRaidY::create(config(h), children).await.unwrap()
    }

    /// Reopen with children at `faulted` indices missing.
    async fn reopen_degraded(h: &Harness, uuid: Uuid, faulted: &[usize]) -> VdevRaidY {
        let mut opened: Vec<Option<Box<dyn ChildVdev>>> = Vec::new();
        for (i, p) in h.paths.iter().enumerate() {
            if faulted.contains(&i) {
                opened.push(None);
            } else {
                opened.push(Some(Box::new(VdevFile::open(p, uuid, i).unwrap())));
            }
        }
        VdevRaidY::open(config(h), opened).await.unwrap()
    }

    async fn do_test(vdev: &VdevRaidY, ndata: u8, nparity: u8, stripe_size: u32, seed: Option<[u8; 16]>) {
        let max_write = 4u64 * stripe_size as u64 * (ndata - nparity).max(1) as u64;
        let asize = vdev.asize();
        let file_size = ((asize as f64) * 0.5 * test_scale()) as u64;

        let seed = seed.unwrap_or_else(|| {
            let mut seed = [0u8; 16];
            thread_rng().fill_bytes(&mut seed);
            seed
        });
        println!("Using seed {seed:?}");
        let mut rng = XorShiftRng::from_seed(seed);

        let mut nwritten = 0u64;
        let mut ofs = 0u64;
        while nwritten < file_size {
            let write_len = rng.gen_range(1..=max_write).min(asize - ofs);
            if write_len == 0 {
                break;
            }
            let buf = mkbuf(ofs, write_len as usize);
            vdev.write_at(ofs, &buf).await.unwrap();
            nwritten += write_len;
            ofs += write_len;
        }

        ofs = 0;
        let mut nread = 0u64;
        while nread < nwritten {
            let read_len = rng.gen_range(1..=max_write).min(nwritten - nread);
            let expect = mkbuf(ofs, read_len as usize);
            let got = vdev.read_at(ofs, read_len).await.unwrap();
            assert_eq!(got, expect, "mismatch at offset {ofs}, len {read_len}");
            nread += read_len;
            ofs += read_len;
        }
    }

    /// A healthy array under a random write/read workload.
    #[rstest]
    #[case(4, 1, 4096, None)]
    #[case(5, 2, 4096, None)]
    #[case(6, 1, 8192, None)]
    #[case(7, 3, 4096, None)]
    #[tokio::test]
    async fn healthy(
        #[case] ndata: u8,
        #[case] nparity: u8,
        #[case] stripe_size: u32,
        #[case] seed: Option<[u8; 16]>,
    ) {
        let h = harness(ndata, nparity, stripe_size);
        let uuid = Uuid::new_v4();
        let vdev = create_vdev(&h, uuid).await;
        do_test(&vdev, ndata, nparity, stripe_size, seed).await;
        vdev.close().await.unwrap();
    }

    /// An array missing exactly `nparity` children still serves a full
    /// random workload by reconstructing every read.
    #[rstest]
    #[case(4, 1, 4096, &[0])]
    #[case(5, 2, 4096, &[1, 3])]
    #[case(7, 3, 4096, &[0, 2, 5])]
    #[tokio::test]
    async fn degraded(
        #[case] ndata: u8,
        #[case] nparity: u8,
        #[case] stripe_size: u32,
        #[case] faulted: &[usize],
    ) {
        let h = harness(ndata, nparity, stripe_size);
        let uuid = Uuid::new_v4();
        let vdev = create_vdev(&h, uuid).await;
        // Seed some data while healthy so there's something to reconstruct.
        let seed_data = mkbuf(0, stripe_size as usize * ndata as usize * 3);
        vdev.write_at(0, &seed_data).await.unwrap();
        vdev.close().await.unwrap();

        let vdev = reopen_degraded(&h, uuid, faulted).await;
        do_test(&vdev, ndata, nparity, stripe_size, None).await;
        assert!(vdev.stats().read_reconstructs > 0);
    }
}
