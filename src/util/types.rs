use std::any::type_name;

/// Get the name of the type with its module prefix stripped. Generic parameters are dropped,
/// so `foo::Bar<baz::Qux>` becomes `Bar`.
pub fn simple_type_name<T>() -> String
where
    T: ?Sized,
{
    let name = type_name::<T>();
    let name = name.split('<').next().unwrap_or(name);
    name.rsplit("::").next().unwrap_or(name).to_owned()
}

#[cfg(test)]
mod tests {
    struct Foo;

    #[allow(dead_code)]
    struct Generic<T>(T);

    #[test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn simple_type_name() {
        insta::assert_snapshot!(super::simple_type_name::<Foo>(), @"Foo");
    }

    #[test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn simple_type_name_generic() {
        insta::assert_snapshot!(super::simple_type_name::<Generic<Foo>>(), @"Generic");
    }
}
