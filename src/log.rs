use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

/// Sandbox pipeline phases that can be traced independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Load,
    Validate
}

impl Phase {
    fn bit(&self) -> u8 {
        match *self {
            Phase::Load => 1 << 0,
            Phase::Validate => 1 << 1
        }
    }
}

/// Phase-gated trace output for one sandbox session. Every component of the
/// session shares the same sink; a phase that was not asked for costs
/// nothing, including its format arguments.
#[derive(Clone)]
pub struct Log<'a> {
    sink: Option<Arc<Mutex<&'a mut dyn Write>>>,
    phases: u8
}

impl <'a> Log<'a> {
    pub fn disabled() -> Log<'a> {
        Log { sink: None, phases: 0 }
    }

    pub fn for_phases(phases: &[Phase], w: &'a mut dyn Write) -> Log<'a> {
        let mask = phases.iter().fold(0, |mask, phase| mask | phase.bit());

        if mask == 0 {
            Log::disabled()
        } else {
            Log {
                sink: Some(Arc::new(Mutex::new(w))),
                phases: mask
            }
        }
    }

    pub fn traces(&self, phase: Phase) -> bool {
        self.sink.is_some() && (self.phases & phase.bit()) != 0
    }

    pub fn lock(&self, phase: Phase) -> Option<MutexGuard<&'a mut dyn Write>> {
        if !self.traces(phase) {
            return None;
        };

        self.sink.as_ref().map(|mutex| mutex.lock().unwrap())
    }
}

#[macro_export]
macro_rules! log_writeln {
    ($log:expr, $phase:expr, $($arg:tt)*) => {
        if let Some(mut w) = $log.lock($phase) {
            writeln!(w, $($arg)*).unwrap();
        };
    }
}

#[cfg(test)]
mod tests {
    use super::{Log, Phase};

    #[test]
    fn test_traced_phase_reaches_sink() {
        let mut sink = vec![];

        log_writeln!(Log::for_phases(&[Phase::Load], &mut sink), Phase::Load, "rewrote {}", "com/example/A");

        assert_eq!(b"rewrote com/example/A\n", &sink[..]);
    }

    #[test]
    fn test_untraced_phase_is_discarded_without_evaluating_args() {
        let mut evaluated = false;
        let mut sink = vec![];

        log_writeln!(Log::for_phases(&[Phase::Validate], &mut sink), Phase::Load, "{}", {
            evaluated = true;
            ""
        });

        assert!(sink.is_empty());
        assert_eq!(false, evaluated);
    }

    #[test]
    fn test_traced_phase_evaluates_args() {
        let mut evaluated = false;
        let mut sink = vec![];

        log_writeln!(Log::for_phases(&[Phase::Load], &mut sink), Phase::Load, "{}", {
            evaluated = true;
            ""
        });

        assert_eq!(true, evaluated);
    }

    #[test]
    fn test_disabled_log_traces_nothing() {
        assert_eq!(false, Log::disabled().traces(Phase::Load));
        assert_eq!(false, Log::disabled().traces(Phase::Validate));
    }

    #[test]
    fn test_phases_combine() {
        let mut sink = vec![];
        let log = Log::for_phases(&[Phase::Load, Phase::Validate], &mut sink);

        assert!(log.traces(Phase::Load));
        assert!(log.traces(Phase::Validate));
    }

    #[test]
    fn test_empty_phase_list_is_disabled() {
        let mut sink = vec![];

        assert_eq!(false, Log::for_phases(&[], &mut sink).traces(Phase::Load));
    }
}
