/// Assigns listen ports to instances in configuration order.
///
/// With a non-zero global base, ports count up from the base. Otherwise
/// each engine flavor counts up from its conventional default, so that a
/// mix of engines lands on the ports their clients expect.
#[derive(Debug)]
pub struct PortAllocator {
    global: u16,
    mysql: u16,
    postgres: u16,
    sqlserver: u16,
}

impl PortAllocator {
    const MYSQL: u16 = 3306;
    const POSTGRES: u16 = 5432;
    const SQLSERVER: u16 = 1433;

    pub fn new(global_base: u16) -> Self {
        PortAllocator {
            global: global_base,
            mysql: Self::MYSQL,
            postgres: Self::POSTGRES,
            sqlserver: Self::SQLSERVER,
        }
    }

    /// The port for the next instance. An explicit per-instance port wins
    /// and advances no counter; an unrecognized flavor falls through to
    /// the global counter.
    pub fn assign(&mut self, explicit: Option<u16>, flavor: &str) -> u16 {
        if let Some(port) = explicit {
            return port;
        }
        if self.global != 0 {
            return Self::bump(&mut self.global);
        }
        if flavor.starts_with("MYSQL") {
            Self::bump(&mut self.mysql)
        } else if flavor.starts_with("POSTGRES") {
            Self::bump(&mut self.postgres)
        } else if flavor.starts_with("SQLSERVER") {
            Self::bump(&mut self.sqlserver)
        } else {
            Self::bump(&mut self.global)
        }
    }

    fn bump(counter: &mut u16) -> u16 {
        let port = *counter;
        *counter += 1;
        port
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn explicit_port_wins_without_advancing() {
        let mut ports = PortAllocator::new(0);
        assert_eq!(ports.assign(Some(9000), "POSTGRES_16"), 9000);
        assert_eq!(ports.assign(None, "POSTGRES_16"), 5432);
    }

    #[test]
    fn global_base_overrides_flavor_defaults() {
        let mut ports = PortAllocator::new(6000);
        assert_eq!(ports.assign(None, "POSTGRES_16"), 6000);
        assert_eq!(ports.assign(None, "MYSQL_8_0"), 6001);
        assert_eq!(ports.assign(None, "SQLSERVER_2019"), 6002);
    }

    #[test]
    fn flavor_counters_advance_independently() {
        let mut ports = PortAllocator::new(0);
        assert_eq!(ports.assign(None, "POSTGRES_16"), 5432);
        assert_eq!(ports.assign(None, "POSTGRES_14"), 5433);
        assert_eq!(ports.assign(None, "MYSQL_8_0"), 3306);
        assert_eq!(ports.assign(None, "SQLSERVER_2019"), 1433);
        assert_eq!(ports.assign(None, "POSTGRES_16"), 5434);
    }

    #[test]
    fn unknown_flavor_falls_through_to_global() {
        let mut ports = PortAllocator::new(0);
        // A zero global base means the first fall-through lands on zero,
        // which the OS resolves to an ephemeral port at bind time.
        assert_eq!(ports.assign(None, "ORACLE_23"), 0);
        assert_eq!(ports.assign(None, "ORACLE_23"), 1);
    }
}
