//! A stalled engine must not hang the session: the completion wait is
//! bounded and gives back a degraded result, distinct from both success and
//! an engine-reported error. Recovery is the caller's destructive interrupt.

mod common;

#[cfg(unix)]
mod unix {
    use std::time::{Duration, Instant};

    use crate::common;
    use sas_console::{InterruptOutcome, SasSession, SessionConfig};

    fn short_timeout_config(stub: &common::StubEngine) -> SessionConfig {
        SessionConfig {
            completion_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            ..common::stub_config(stub)
        }
    }

    #[test]
    fn stalled_engine_yields_a_degraded_result_with_partial_log() -> common::TestResult<()> {
        common::init_tracing();
        let stub = common::stub_engine()?;
        let mut session = SasSession::new(short_timeout_config(&stub));

        let started = Instant::now();
        let result = session.execute("%put partial output;\nhang")?;
        assert!(result.timed_out, "expected the distinct timeout flag");
        assert!(
            result.log.contains("partial output"),
            "accumulated output must be returned: {}",
            result.log
        );
        assert!(
            !result.is_error,
            "a stream timeout is not an engine-reported error"
        );
        assert!(
            started.elapsed() < Duration::from_secs(15),
            "the wait must respect its budget"
        );

        // The engine is still wedged; interrupt is the documented way out.
        let outcome = session.interrupt()?;
        assert_eq!(outcome, InterruptOutcome::RestartedStateLost);

        let recovered = session.execute("%put recovered;")?;
        assert!(!recovered.timed_out);
        assert!(recovered.log.contains("recovered"));

        session.shutdown();
        Ok(())
    }

    #[test]
    fn idle_budget_cuts_the_wait_before_the_total_budget() -> common::TestResult<()> {
        common::init_tracing();
        let stub = common::stub_engine()?;
        let config = SessionConfig {
            completion_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
            max_idle_polls: 10,
            ..common::stub_config(&stub)
        };
        let mut session = SasSession::new(config);

        let started = Instant::now();
        let result = session.execute("hang")?;
        assert!(result.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(30),
            "idle budget must cut the wait well before the total budget"
        );

        session.shutdown();
        Ok(())
    }
}
