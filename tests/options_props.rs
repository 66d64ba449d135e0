use proptest::prelude::*;
use tandem::{Error, ExecutionMode, ModeOverride, Options, negotiate};

fn override_strategy() -> impl Strategy<Value = Option<ModeOverride>> {
    prop_oneof![
        Just(None),
        Just(Some(ModeOverride::Thread)),
        Just(Some(ModeOverride::Pthread)),
        Just(Some(ModeOverride::Process)),
        Just(Some(ModeOverride::ProcessPreload)),
        Just(Some(ModeOverride::ProcessPipclone)),
        Just(Some(ModeOverride::ProcessGot)),
    ]
}

// Requests made only of recognized bits.
fn known_bits_strategy() -> impl Strategy<Value = Options> {
    (0..=Options::VALID.bits())
        .prop_map(|bits| Options::from_bits(bits & Options::VALID.bits()))
}

fn primitives() -> Vec<Options> {
    let mut primitives = vec![Options::PROCESS_PRELOAD, Options::PROCESS_CLONE];
    #[cfg(target_os = "linux")]
    primitives.push(Options::PROCESS_GOT);
    primitives
}

proptest! {
    #[test]
    fn test_unknown_bits_are_always_rejected(
        bits in any::<u32>(),
        env in override_strategy(),
    ) {
        let requested = Options::from_bits(bits);
        prop_assume!(!requested.unknown().is_empty());

        prop_assert!(matches!(negotiate(requested, env), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_complement_of_valid_mask_is_rejected(extra in known_bits_strategy()) {
        let requested = Options::VALID.complement() | extra;

        prop_assert!(matches!(negotiate(requested, None), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_thread_with_any_process_bit_is_rejected(
        bits in known_bits_strategy(),
        env in override_strategy(),
    ) {
        prop_assume!(bits.intersects(Options::PROCESS | Options::PROCESS_PRELOAD | Options::PROCESS_CLONE));

        let requested = bits | Options::THREAD;

        prop_assert!(matches!(negotiate(requested, env), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_two_primitives_are_rejected(
        first in 0..3usize,
        second in 0..3usize,
        env in override_strategy(),
    ) {
        let primitives = primitives();
        let (first, second) = (first % primitives.len(), second % primitives.len());
        prop_assume!(first != second);

        let requested = primitives[first] | primitives[second];

        prop_assert!(matches!(negotiate(requested, env), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_valid_requests_never_fail_as_invalid(
        env in override_strategy(),
        choice in 0..5usize,
    ) {
        let requests = [
            Options::AUTO,
            Options::THREAD,
            Options::PROCESS,
            Options::PROCESS_CLONE,
            Options::PROCESS | Options::PROCESS_PRELOAD,
        ];
        let requested = requests[choice];

        match negotiate(requested, env) {
            Ok(mode) => {
                if requested.contains(Options::THREAD) {
                    prop_assert_eq!(mode, ExecutionMode::Thread);
                }
                if requested.intersects(Options::PROCESS | Options::PROCESS_CLONE) {
                    prop_assert!(mode.is_process());
                }
            }
            Err(Error::PermissionDenied(_)) => {
                prop_assert!(env.is_some(), "only an override can refuse a request");
            }
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }
}
